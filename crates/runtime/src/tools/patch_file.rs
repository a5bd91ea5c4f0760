//! `patch_file` tool — surgical string replacement inside a vault file.
//!
//! Instead of read → full rewrite, the model sends only the exact text to
//! replace and the replacement.
//!
//!   1. Read the file from disk.
//!   2. Find `old` (exact match, whitespace-sensitive).
//!   3. Replace with `new` (first occurrence, or all if replace_all=true).
//!   4. Write the result back atomically via a temp file + rename.
//!   5. Return a one-line summary or a clear error if `old` was not found.

use std::path::PathBuf;

use async_trait::async_trait;

use super::vault;
use super::{Tool, ToolResult};

pub struct PatchFileTool {
    person_root: PathBuf,
}

impl PatchFileTool {
    pub fn new(person_root: PathBuf) -> Self {
        Self { person_root }
    }
}

#[async_trait]
impl Tool for PatchFileTool {
    fn name(&self) -> &str {
        "patch_file"
    }

    fn description(&self) -> &str {
        "Make a surgical edit to a vault file by replacing an exact string with new \
         text. Prefer this over write_file when changing only part of a file — it is \
         safer (only the matched region changes) and much cheaper on tokens. \
         The match is exact and whitespace-sensitive: copy the old text verbatim \
         from read_file output. Returns an error if old_string is not found or is ambiguous."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to edit, relative to the vault root."
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to find. Must appear in the file. Copy it verbatim from read_file output — including indentation and newlines."
                },
                "new_string": {
                    "type": "string",
                    "description": "Text to replace old_string with. Use an empty string to delete old_string."
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence instead of just the first. Default false."
                }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let requested = match input.get("path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolResult::error("missing required parameter: path"),
        };
        let old = match input.get("old_string").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolResult::error("missing required parameter: old_string"),
        };
        let new = match input.get("new_string").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolResult::error("missing required parameter: new_string"),
        };
        let replace_all = input
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let path = match vault::resolve(&self.person_root, requested) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("failed to read '{requested}': {e}")),
        };

        let count = content.matches(old.as_str()).count();
        if count == 0 {
            return ToolResult::error(format!(
                "old_string not found in '{requested}'. Use read_file first and copy the text verbatim."
            ));
        }
        if !replace_all && count > 1 {
            return ToolResult::error(format!(
                "old_string matches {count} times in '{requested}'. \
                 Add more surrounding context to make it unique, or set replace_all=true."
            ));
        }

        let updated = if replace_all {
            content.replace(old.as_str(), new.as_str())
        } else {
            content.replacen(old.as_str(), new.as_str(), 1)
        };

        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".notes_agent_patch_tmp");
        let tmp_path = path.with_file_name(tmp_name);
        if let Err(e) = std::fs::write(&tmp_path, &updated) {
            return ToolResult::error(format!(
                "failed to write temp file for '{requested}': {e}"
            ));
        }
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return ToolResult::error(format!("failed to rename temp file for '{requested}': {e}"));
        }

        let occurrences = if replace_all {
            format!("{count} occurrence(s)")
        } else {
            "1 occurrence".to_string()
        };
        ToolResult::success(format!("Patched '{requested}': replaced {occurrences} of old_string."))
    }
}
