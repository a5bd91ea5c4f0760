//! Tool: write_file — write content to a file in a person's vault, creating
//! parent directories as needed.

use std::path::PathBuf;

use async_trait::async_trait;

use super::vault;
use super::{Tool, ToolResult};

pub struct WriteFileTool {
    person_root: PathBuf,
}

impl WriteFileTool {
    pub fn new(person_root: PathBuf) -> Self {
        Self { person_root }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the vault. Creates parent directories if they \
         do not exist. Overwrites the file if it already exists."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to write to, relative to the vault root."
                },
                "content": {
                    "type": "string",
                    "description": "Text content to write into the file."
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let requested = match input.get("path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolResult::error("missing required parameter: path"),
        };

        let content = match input.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolResult::error("missing required parameter: content"),
        };

        let path = match vault::resolve(&self.person_root, requested) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return ToolResult::error(format!(
                        "failed to create directories for '{requested}': {e}"
                    ));
                }
            }
        }

        let byte_len = content.len();
        if let Err(e) = std::fs::write(&path, content) {
            return ToolResult::error(format!("failed to write '{requested}': {e}"));
        }

        ToolResult::success(format!("File written: {byte_len} bytes to '{requested}'"))
    }
}
