// ── Keystone Shared: Tool Registry ─────────────────────────────────────────
// The canonical catalog of capability tools. Every tool the selector may
// pick, the tool server may dispatch, or the safety gate may classify is
// declared here with its JSON-schema parameters.
//
// Sensitivity and read-only flags drive the tiered safety gate: read-only
// non-sensitive tools pass unreviewed; sensitive tools require the approval
// queue unless pre-approved.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the params object.
    pub parameters: Value,
    /// Sensitive tools return HTTP 403 from the tool server unless
    /// pre-approved; the engine converts that into a pending approval.
    pub sensitive: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ToolRegistry {
    /// The platform's built-in tool set.
    pub fn builtin() -> Self {
        let tools = vec![
            ToolSpec {
                name: "read_file".into(),
                description: "Read a file under an allowlisted root.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Absolute path to read"}
                    },
                    "required": ["path"]
                }),
                sensitive: false,
                read_only: true,
            },
            ToolSpec {
                name: "write_file".into(),
                description: "Write content to a file under an allowlisted root.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }),
                sensitive: true,
                read_only: false,
            },
            ToolSpec {
                name: "run_shell".into(),
                description: "Run a command with a safe tokenizer and timeout.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string"},
                        "shell": {"type": "boolean", "default": false}
                    },
                    "required": ["command"]
                }),
                sensitive: true,
                read_only: false,
            },
            ToolSpec {
                name: "embedding_query".into(),
                description: "Semantic search over the vector indices.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "top_k": {"type": "integer", "default": 5}
                    },
                    "required": ["query"]
                }),
                sensitive: false,
                read_only: true,
            },
            ToolSpec {
                name: "embed_documents".into(),
                description: "Embed documents into the active knowledge base.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "paths": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["paths"]
                }),
                sensitive: true,
                read_only: false,
            },
            ToolSpec {
                name: "web_search".into(),
                description: "Domain-tiered web search, rate limited.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "content_type": {"type": "string"},
                        "domain_filter": {"type": "string"},
                        "max_results": {"type": "integer", "minimum": 1, "maximum": 10}
                    },
                    "required": ["query"]
                }),
                sensitive: false,
                read_only: true,
            },
            ToolSpec {
                name: "web_fetch".into(),
                description: "Fetch a page from an allowlisted domain (500 KB cap).".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "url": {"type": "string"}
                    },
                    "required": ["url"]
                }),
                sensitive: false,
                read_only: true,
            },
            ToolSpec {
                name: "introspect_logs".into(),
                description: "Read recent log lines from a platform service.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "service": {"type": "string"},
                        "lines": {"type": "integer", "maximum": 200},
                        "search": {"type": "string"},
                        "level": {"type": "string"}
                    },
                    "required": ["service"]
                }),
                sensitive: false,
                read_only: true,
            },
        ];
        ToolRegistry { tools }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.get(name).map(|t| t.sensitive).unwrap_or(true)
    }

    pub fn is_read_only(&self, name: &str) -> bool {
        self.get(name).map(|t| t.read_only).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter()
    }

    /// Catalog filtered to what a given intent may use; read-only intents
    /// only see read-only tools.
    pub fn catalog_for(&self, read_only: bool) -> Vec<String> {
        self.tools
            .iter()
            .filter(|t| !read_only || t.read_only)
            .map(|t| t.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let r = ToolRegistry::builtin();
        assert!(r.get("read_file").is_some());
        assert!(r.get("write_file").unwrap().sensitive);
        assert!(!r.get("web_search").unwrap().sensitive);
        assert!(r.get("no_such_tool").is_none());
    }

    #[test]
    fn test_unknown_tool_is_sensitive_by_default() {
        let r = ToolRegistry::builtin();
        assert!(r.is_sensitive("mystery_tool"));
    }

    #[test]
    fn test_read_only_catalog_excludes_writers() {
        let r = ToolRegistry::builtin();
        let catalog = r.catalog_for(true);
        assert!(catalog.contains(&"read_file".to_string()));
        assert!(!catalog.contains(&"write_file".to_string()));
        assert!(!catalog.contains(&"run_shell".to_string()));
    }
}
