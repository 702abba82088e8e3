//! Turning pasted interactive sessions into runnable cells.

/// Split a `>>> ` / `... ` transcript into cell sources.
///
/// Prompted lines start (or extend) a cell, continuation lines extend it,
/// anything else is output and closes the current cell. Text without a
/// single input prompt is returned as `None` so callers keep it untouched.
pub fn split_input_prompts(
    text: &str,
    in_prompt: &str,
    continuation_prompt: Option<&str>,
) -> Option<Vec<String>> {
    let raw = text.trim();
    if in_prompt.is_empty() || !raw.contains(in_prompt) {
        return None;
    }

    let mut cells = Vec::new();
    let mut current: Option<String> = None;
    for line in raw.lines().map(str::trim) {
        if let Some(code) = line.strip_prefix(in_prompt) {
            let cell = current.get_or_insert_with(String::new);
            cell.push_str(code);
            cell.push('\n');
        } else if let Some(code) = continuation_prompt
            .filter(|p| !p.is_empty())
            .and_then(|p| line.strip_prefix(p))
        {
            let cell = current.get_or_insert_with(String::new);
            cell.push_str(code);
            cell.push('\n');
        } else if let Some(cell) = current.take() {
            cells.push(cell);
        }
    }
    cells.extend(current);
    Some(cells)
}

/// Split text on output-prompt lines: every run of non-prompt lines becomes a
/// cell and the prompt lines themselves are dropped.
pub fn split_output_prompts(text: &str, out_prompt: &str) -> Option<Vec<String>> {
    let raw = text.trim();
    if out_prompt.is_empty() || !raw.contains(out_prompt) {
        return None;
    }

    let mut cells = Vec::new();
    let mut current: Option<String> = None;
    for line in raw.lines().map(str::trim) {
        if line.starts_with(out_prompt) {
            if let Some(cell) = current.take() {
                cells.push(cell);
            }
        } else {
            let cell = current.get_or_insert_with(String::new);
            cell.push_str(line);
            cell.push('\n');
        }
    }
    cells.extend(current);
    Some(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_input_prompts() {
        let cells = split_input_prompts(">>> x=1\n... y=2\noutput", ">>> ", Some("... ")).unwrap();
        assert_eq!(cells, vec!["x=1\ny=2\n"]);
    }

    #[test]
    fn test_split_input_prompts_multiple_cells() {
        let text = ">>> a = 1\n>>> a + 1\n2\n>>> for i in range(2):\n...     print(i)\n0\n1";
        let cells = split_input_prompts(text, ">>> ", Some("... ")).unwrap();
        assert_eq!(cells, vec!["a = 1\na + 1\n", "for i in range(2):\n    print(i)\n"]);
    }

    #[test]
    fn test_split_input_prompts_without_prompt() {
        assert_eq!(split_input_prompts("x = 1", ">>> ", None), None);
        assert_eq!(split_input_prompts("x = 1", "", None), None);
    }

    #[test]
    fn test_split_output_prompts() {
        let text = "f x = x\nOut: f\ng = f 1\nh = g\nOut: done";
        let cells = split_output_prompts(text, "Out:").unwrap();
        assert_eq!(cells, vec!["f x = x\n", "g = f 1\nh = g\n"]);
        assert_eq!(split_output_prompts("no prompt", "Out:"), None);
    }
}
