//! Layered page options.
//!
//! Options come from three JSON layers, merged in order
//! (compiled-in defaults < page-embedded config < call-site overrides),
//! after which a handful of stored user preferences are applied:
//!
//! - `input-useBinder` (`yes`/`no`) switches ephemeral builds on or off and,
//!   when on, pulls the repository, ref, build URL and saved-session toggle
//!   from the store
//! - `input-loadFromStore` (`yes`/`no`) overrides `kernelOptions.loadFromStore`

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::store::{keys, KeyValueStore};

pub const DEFAULT_SELECTOR: &str = "[data-executable]";
pub const DEFAULT_OUTPUT_SELECTOR: &str = "[data-output]";
pub const DEFAULT_REF: &str = "master";
pub const DEFAULT_BINDER_URL: &str = "https://mybinder.org";
pub const DEFAULT_STORAGE_PREFIX: &str = "thebe-binder-";
pub const DEFAULT_MAX_AGE_SECS: u64 = 86400;

/// Media type of page-embedded config blocks.
pub const PAGE_CONFIG_TYPE: &str = "text/x-thebe-config";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// Which page blocks become cells.
    pub selector: String,
    /// Which block right after a cell holds its pre-rendered output.
    pub output_selector: String,
    /// Connect as soon as the page loads instead of on the first action.
    pub request_kernel: bool,
    /// Run every cell once the kernel is bound.
    pub run_all_cells: bool,
    pub predefined_output: bool,
    #[serde(deserialize_with = "false_as_none")]
    pub strip_prompts: Option<PromptOptions>,
    #[serde(deserialize_with = "false_as_none")]
    pub strip_output_prompts: Option<OutputPromptOptions>,
    pub binder_options: BinderOptions,
    pub kernel_options: KernelOptions,
    /// Editor settings, passed through to the editing surface untouched.
    pub code_mirror_config: Map<String, Value>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            selector: DEFAULT_SELECTOR.to_string(),
            output_selector: DEFAULT_OUTPUT_SELECTOR.to_string(),
            request_kernel: false,
            run_all_cells: false,
            predefined_output: true,
            strip_prompts: None,
            strip_output_prompts: None,
            binder_options: BinderOptions::default(),
            kernel_options: KernelOptions::default(),
            code_mirror_config: Map::new(),
        }
    }
}

impl Options {
    /// True when the kernel should come from an ephemeral build.
    pub fn use_ephemeral_build(&self) -> bool {
        self.binder_options
            .repo
            .as_deref()
            .is_some_and(|repo| !repo.trim().is_empty())
    }
}

/// Interactive-session prompt splitting (`>>> ` / `... `).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptOptions {
    pub in_prompt: String,
    #[serde(default)]
    pub continuation_prompt: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
}

/// Output-prompt splitting (`Out: `).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPromptOptions {
    pub out_prompt: String,
    #[serde(default)]
    pub selector: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepoProvider {
    #[default]
    Github,
    Gitlab,
    Git,
}

impl RepoProvider {
    /// Path segment used by the build service.
    pub fn as_path(&self) -> &'static str {
        match self {
            RepoProvider::Github => "gh",
            RepoProvider::Gitlab => "gl",
            RepoProvider::Git => "git",
        }
    }
}

impl Serialize for RepoProvider {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_path())
    }
}

/// Accepts `gh`/`github`, `gl`/`gitlab` and `git` in any case; an empty
/// string means GitHub.
impl<'de> Deserialize<'de> for RepoProvider {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "" | "gh" | "github" => Ok(RepoProvider::Github),
            "gl" | "gitlab" => Ok(RepoProvider::Gitlab),
            "git" => Ok(RepoProvider::Git),
            other => Err(serde::de::Error::custom(format!(
                "unknown repository provider {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BinderOptions {
    pub repo: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub binder_url: String,
    pub repo_provider: RepoProvider,
    pub saved_session: SavedSessionOptions,
}

impl Default for BinderOptions {
    fn default() -> Self {
        Self {
            repo: None,
            git_ref: DEFAULT_REF.to_string(),
            binder_url: DEFAULT_BINDER_URL.to_string(),
            repo_provider: RepoProvider::default(),
            saved_session: SavedSessionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SavedSessionOptions {
    pub enabled: bool,
    /// Seconds since last use after which a saved session is discarded.
    pub max_age: u64,
    pub storage_prefix: String,
}

impl Default for SavedSessionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age: DEFAULT_MAX_AGE_SECS,
            storage_prefix: DEFAULT_STORAGE_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelOptions {
    /// Kernel spec name; the server default when unset.
    pub name: Option<String>,
    pub path: String,
    /// Ask the backend to reload cell state from its own store on first run.
    pub load_from_store: bool,
    /// Ask the backend to persist cell changes.
    pub persistent: bool,
    pub server_settings: ServerSettingsOptions,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            name: None,
            path: "/".to_string(),
            load_from_store: true,
            persistent: true,
            server_settings: ServerSettingsOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettingsOptions {
    pub base_url: Option<String>,
    pub ws_url: Option<String>,
    pub token: Option<String>,
    pub append_token: bool,
}

impl Default for ServerSettingsOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            ws_url: None,
            token: None,
            append_token: true,
        }
    }
}

/// `false`, `null` or absent all mean "off".
fn false_as_none<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Recursively merge `layer` into `base`.
///
/// Objects merge key by key; anything else in `layer` replaces the value in
/// `base`. `null` in `layer` leaves `base` untouched.
pub fn deep_merge(base: &mut Value, layer: &Value) {
    match (base, layer) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None if value.is_null() => {}
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, layer) => *base = layer.clone(),
    }
}

/// Merge the contents of every page config block, in page order.
///
/// Blocks that are not valid JSON objects are logged and skipped.
pub fn page_config_from_blocks<'a, I>(blocks: I) -> Value
where
    I: IntoIterator<Item = &'a str>,
{
    let mut merged = Value::Object(Map::new());
    for (index, block) in blocks.into_iter().enumerate() {
        match serde_json::from_str::<Value>(block) {
            Ok(value @ Value::Object(_)) => {
                debug!("[page] Loaded config block {}", index);
                deep_merge(&mut merged, &value);
            }
            Ok(other) => warn!(
                "[page] Ignoring config block {}: expected an object, got {}",
                index, other
            ),
            Err(e) => warn!("[page] Ignoring malformed config block {}: {}", index, e),
        }
    }
    merged
}

/// Merge defaults, page config and call-site overrides, then apply stored
/// user preferences.
pub fn merge_options(
    page: &Value,
    overrides: Option<&Value>,
    prefs: &dyn KeyValueStore,
) -> Result<Options> {
    let mut merged =
        serde_json::to_value(Options::default()).map_err(|e| Error::Config(e.to_string()))?;
    deep_merge(&mut merged, page);
    if let Some(overrides) = overrides {
        deep_merge(&mut merged, overrides);
    }
    let mut options: Options =
        serde_json::from_value(merged).map_err(|e| Error::Config(e.to_string()))?;
    apply_preferences(&mut options, prefs);
    Ok(options)
}

fn pref(prefs: &dyn KeyValueStore, key: &str) -> Option<String> {
    match prefs.get(key) {
        Ok(value) => value,
        Err(e) => {
            warn!("[store] Failed to read preference {}: {}", key, e);
            None
        }
    }
}

fn apply_preferences(options: &mut Options, prefs: &dyn KeyValueStore) {
    let binder = &mut options.binder_options;
    match pref(prefs, keys::USE_BINDER).as_deref() {
        Some("yes") => {
            info!("[page] Stored preference: use ephemeral build");
            binder.repo = pref(prefs, keys::REPOSITORY).filter(|s| !s.is_empty());
            if let Some(git_ref) = pref(prefs, keys::REF).filter(|s| !s.is_empty()) {
                binder.git_ref = git_ref;
            }
            if let Some(url) = pref(prefs, keys::BINDER_URL).filter(|s| !s.is_empty()) {
                binder.binder_url = url;
            }
            binder.saved_session.enabled =
                pref(prefs, keys::SAVED_SESSION).as_deref() == Some("yes");
        }
        Some("no") => {
            info!("[page] Stored preference: do not use ephemeral build");
            binder.repo = None;
            binder.git_ref.clear();
            binder.binder_url.clear();
        }
        _ => {}
    }

    match pref(prefs, keys::LOAD_FROM_STORE).as_deref() {
        Some("yes") => options.kernel_options.load_from_store = true,
        Some("no") => options.kernel_options.load_from_store = false,
        _ => {}
    }
}
