//! Function executors shipped with the binary.
//!
//! Agents refer to these by name from their function tool configs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use av_core::{
    Error, FnExecutor, FunctionToolRegistry, ParameterSchema, PropertySchema, ToolContext,
    ToolExecutor, ToolParameters,
};

const MAX_NOTE_BYTES: usize = 64 * 1024;

/// Registry with `echo`, `current_time`, `read_note` and `list_notes`.
pub fn builtin_executors(notes_root: PathBuf) -> FunctionToolRegistry {
    let notes = Arc::new(NotesRoot::new(notes_root));
    FunctionToolRegistry::new()
        .with("echo", Arc::new(echo_executor()))
        .with("current_time", Arc::new(current_time_executor()))
        .with("read_note", Arc::new(ReadNoteExecutor(notes.clone())))
        .with("list_notes", Arc::new(ListNotesExecutor(notes)))
}

fn echo_executor() -> FnExecutor {
    FnExecutor::new(|args: Value, _ctx: ToolContext| async move {
        args.get("text")
            .cloned()
            .ok_or_else(|| Error::tool("echo", "missing 'text' argument"))
    })
    .with_parameters(
        ToolParameters::new().add_property("text", PropertySchema::string("Text to echo back"), true),
    )
}

fn current_time_executor() -> FnExecutor {
    FnExecutor::new(|_args: Value, _ctx: ToolContext| async move {
        let now = chrono::Local::now();
        Ok(json!({
            "iso": now.to_rfc3339(),
            "weekday": now.format("%A").to_string(),
        }))
    })
    .with_parameters(ToolParameters::new())
}

struct NotesRoot {
    root: PathBuf,
}

impl NotesRoot {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve `path` under the root, refusing anything that escapes it.
    fn resolve(&self, tool: &str, path: &str) -> Result<PathBuf, Error> {
        let requested = Path::new(path);
        let resolved = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let canonical = resolved
            .canonicalize()
            .map_err(|e| Error::tool(tool, format!("Invalid path '{}': {}", path, e)))?;
        let canonical_root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        if !canonical.starts_with(&canonical_root) {
            return Err(Error::tool(tool, format!("Path '{}' is outside the notes root", path)));
        }
        Ok(canonical)
    }

    fn relative(&self, path: &Path) -> String {
        let canonical_root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        path.strip_prefix(&canonical_root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

fn string_arg<'a>(tool: &str, args: &'a Value, name: &str) -> Result<&'a str, Error> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::tool(tool, format!("missing '{}' argument", name)))
}

struct ReadNoteExecutor(Arc<NotesRoot>);

#[async_trait]
impl ToolExecutor for ReadNoteExecutor {
    async fn call(&self, arguments: Value, _ctx: &ToolContext) -> Result<Value, Error> {
        let path = self.0.resolve("read_note", string_arg("read_note", &arguments, "path")?)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::tool("read_note", format!("Failed to read note: {}", e)))?;

        if content.len() > MAX_NOTE_BYTES {
            let mut end = MAX_NOTE_BYTES;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            return Ok(Value::String(format!(
                "{}\n[truncated: note is {} bytes]",
                &content[..end],
                content.len()
            )));
        }
        Ok(Value::String(content))
    }

    fn parameters(&self) -> Option<ParameterSchema> {
        Some(
            ToolParameters::new()
                .add_property(
                    "path",
                    PropertySchema::string("Note path relative to the notes root"),
                    true,
                )
                .into(),
        )
    }
}

struct ListNotesExecutor(Arc<NotesRoot>);

#[async_trait]
impl ToolExecutor for ListNotesExecutor {
    async fn call(&self, arguments: Value, _ctx: &ToolContext) -> Result<Value, Error> {
        let dir = match arguments.get("folder").and_then(Value::as_str) {
            Some(folder) if !folder.is_empty() => self.0.resolve("list_notes", folder)?,
            _ => self.0.resolve("list_notes", ".")?,
        };

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::tool("list_notes", format!("Failed to list notes: {}", e)))?;

        let mut notes = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::tool("list_notes", e.to_string()))?
        {
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                notes.push(format!("{}/", self.0.relative(&path)));
            } else if path.extension().is_some_and(|ext| ext == "md") {
                notes.push(self.0.relative(&path));
            }
        }
        notes.sort();
        Ok(json!(notes))
    }

    fn parameters(&self) -> Option<ParameterSchema> {
        Some(
            ToolParameters::new()
                .add_property(
                    "folder",
                    PropertySchema::string("Folder relative to the notes root; empty for the root"),
                    true,
                )
                .into(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext::new("test")
    }

    #[tokio::test]
    async fn test_echo_and_time() {
        let registry = builtin_executors(PathBuf::from("."));
        let echo = registry.get("echo").unwrap();
        assert_eq!(echo.call(json!({"text": "hi"}), &ctx()).await.unwrap(), json!("hi"));
        assert!(echo.call(json!({}), &ctx()).await.is_err());

        let time = registry.get("current_time").unwrap();
        let value = time.call(json!({}), &ctx()).await.unwrap();
        assert!(value["iso"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_read_and_list_notes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("daily")).unwrap();
        std::fs::write(dir.path().join("ideas.md"), "# Ideas").unwrap();
        std::fs::write(dir.path().join("daily").join("today.md"), "Walk").unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8; 4]).unwrap();

        let registry = builtin_executors(dir.path().to_path_buf());

        let read = registry.get("read_note").unwrap();
        let note = read.call(json!({"path": "daily/today.md"}), &ctx()).await.unwrap();
        assert_eq!(note, json!("Walk"));

        let list = registry.get("list_notes").unwrap();
        let listed = list.call(json!({"folder": ""}), &ctx()).await.unwrap();
        assert_eq!(listed, json!(["daily/", "ideas.md"]));
    }

    #[tokio::test]
    async fn test_notes_cannot_escape_root() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("vault");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("secret.md"), "nope").unwrap();

        let registry = builtin_executors(root);
        let read = registry.get("read_note").unwrap();
        let err = read
            .call(json!({"path": "../secret.md"}), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the notes root"));
    }
}
