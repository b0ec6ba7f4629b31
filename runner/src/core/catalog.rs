//! Declarative tool catalog.
//!
//! The catalog is the single source of truth for which tools exist, what
//! parameters they take, and which limit class applies to them. The step
//! schema's `tool` enum and the executor registry are both derived from it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Every tool the executor knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ReadFile,
    WriteFile,
    AppendFile,
    TextReplace,
    SearchText,
    ExtractPattern,
    FilterJson,
    HttpGet,
    DownloadFile,
}

impl ToolName {
    pub const ALL: [ToolName; 9] = [
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::AppendFile,
        ToolName::TextReplace,
        ToolName::SearchText,
        ToolName::ExtractPattern,
        ToolName::FilterJson,
        ToolName::HttpGet,
        ToolName::DownloadFile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::AppendFile => "append_file",
            ToolName::TextReplace => "text_replace",
            ToolName::SearchText => "search_text",
            ToolName::ExtractPattern => "extract_pattern",
            ToolName::FilterJson => "filter_json",
            ToolName::HttpGet => "http_get",
            ToolName::DownloadFile => "download_file",
        }
    }

    /// Look up a tool by its wire name. Returns `None` for unknown names.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }

    /// True for tools whose successful run leaves a file behind at `path`.
    pub fn writes_file(&self) -> bool {
        matches!(
            self,
            ToolName::WriteFile
                | ToolName::AppendFile
                | ToolName::TextReplace
                | ToolName::DownloadFile
        )
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a parameter value is interpreted by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Resolved through the sandbox path guard.
    Path,
    /// Free text (file content, replacement text).
    Text,
    /// Regular expression or literal search pattern.
    Pattern,
    /// JSON query in `.a.b[0]` form.
    Query,
    /// http(s) URL.
    Url,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

/// Which size/time limits apply to a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitClass {
    /// Local file tools: file size limit + file timeout.
    File,
    /// Network reads: file size limit for the body + network timeout.
    Network,
    /// Downloads: download size limit + network timeout.
    Download,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ToolSpec {
    pub name: ToolName,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    pub limit: LimitClass,
    /// Whether replanning the same invocation after a failure is reasonable.
    pub retryable: bool,
    pub example: &'static str,
}

impl ToolSpec {
    pub fn path_params(&self) -> impl Iterator<Item = &'static ParamSpec> + '_ {
        self.params.iter().filter(|p| p.kind == ParamKind::Path)
    }
}

const PATH: ParamSpec = ParamSpec {
    name: "path",
    kind: ParamKind::Path,
    required: true,
    description: "file path relative to the sandbox",
};

const CATALOG: [ToolSpec; 9] = [
    ToolSpec {
        name: ToolName::ReadFile,
        description: "Read a text file from the sandbox",
        params: &[PATH],
        limit: LimitClass::File,
        retryable: true,
        example: r#"{"tool":"read_file","reasoning":"inspect notes","parameters":[{"name":"path","value":"notes.txt"}]}"#,
    },
    ToolSpec {
        name: ToolName::WriteFile,
        description: "Create or overwrite a text file in the sandbox",
        params: &[
            PATH,
            ParamSpec {
                name: "content",
                kind: ParamKind::Text,
                required: true,
                description: "full file content",
            },
        ],
        limit: LimitClass::File,
        retryable: true,
        example: r#"{"tool":"write_file","reasoning":"save greeting","parameters":[{"name":"path","value":"greeting.txt"},{"name":"content","value":"Hello, World!"}]}"#,
    },
    ToolSpec {
        name: ToolName::AppendFile,
        description: "Append text to a file in the sandbox, creating it if missing",
        params: &[
            PATH,
            ParamSpec {
                name: "content",
                kind: ParamKind::Text,
                required: true,
                description: "text to append",
            },
        ],
        limit: LimitClass::File,
        retryable: false,
        example: r#"{"tool":"append_file","reasoning":"log result","parameters":[{"name":"path","value":"log.txt"},{"name":"content","value":"done\n"}]}"#,
    },
    ToolSpec {
        name: ToolName::TextReplace,
        description: "Replace every literal occurrence of a string in a file",
        params: &[
            PATH,
            ParamSpec {
                name: "search",
                kind: ParamKind::Pattern,
                required: true,
                description: "literal text to find (non-empty)",
            },
            ParamSpec {
                name: "replace",
                kind: ParamKind::Text,
                required: true,
                description: "replacement text",
            },
        ],
        limit: LimitClass::File,
        retryable: false,
        example: r#"{"tool":"text_replace","reasoning":"fix typo","parameters":[{"name":"path","value":"doc.md"},{"name":"search","value":"teh"},{"name":"replace","value":"the"}]}"#,
    },
    ToolSpec {
        name: ToolName::SearchText,
        description: "List lines of a file matching a regular expression",
        params: &[
            PATH,
            ParamSpec {
                name: "pattern",
                kind: ParamKind::Pattern,
                required: true,
                description: "regular expression",
            },
        ],
        limit: LimitClass::File,
        retryable: true,
        example: r#"{"tool":"search_text","reasoning":"find todos","parameters":[{"name":"path","value":"main.rs"},{"name":"pattern","value":"TODO"}]}"#,
    },
    ToolSpec {
        name: ToolName::ExtractPattern,
        description: "Extract all matches (first capture group if present) of a regular expression",
        params: &[
            PATH,
            ParamSpec {
                name: "pattern",
                kind: ParamKind::Pattern,
                required: true,
                description: "regular expression",
            },
        ],
        limit: LimitClass::File,
        retryable: true,
        example: r#"{"tool":"extract_pattern","reasoning":"collect emails","parameters":[{"name":"path","value":"contacts.txt"},{"name":"pattern","value":"([a-z]+@[a-z.]+)"}]}"#,
    },
    ToolSpec {
        name: ToolName::FilterJson,
        description: "Select a value from a JSON file with a `.key[index]` query",
        params: &[
            PATH,
            ParamSpec {
                name: "query",
                kind: ParamKind::Query,
                required: true,
                description: "query such as .items[0].name (use . for the whole document)",
            },
        ],
        limit: LimitClass::File,
        retryable: true,
        example: r#"{"tool":"filter_json","reasoning":"read version","parameters":[{"name":"path","value":"package.json"},{"name":"query","value":".version"}]}"#,
    },
    ToolSpec {
        name: ToolName::HttpGet,
        description: "Fetch a URL and return the (truncated) response body",
        params: &[ParamSpec {
            name: "url",
            kind: ParamKind::Url,
            required: true,
            description: "http or https URL",
        }],
        limit: LimitClass::Network,
        retryable: true,
        example: r#"{"tool":"http_get","reasoning":"read api","parameters":[{"name":"url","value":"https://example.com/data.json"}]}"#,
    },
    ToolSpec {
        name: ToolName::DownloadFile,
        description: "Download a URL into a sandbox file",
        params: &[
            ParamSpec {
                name: "url",
                kind: ParamKind::Url,
                required: true,
                description: "http or https URL",
            },
            PATH,
        ],
        limit: LimitClass::Download,
        retryable: true,
        example: r#"{"tool":"download_file","reasoning":"fetch dataset","parameters":[{"name":"url","value":"https://example.com/data.csv"},{"name":"path","value":"data.csv"}]}"#,
    },
];

/// The full tool catalog in declaration order.
pub fn catalog() -> &'static [ToolSpec] {
    &CATALOG
}

/// Catalog entry for `name`. Every `ToolName` has exactly one entry.
pub fn spec(name: ToolName) -> &'static ToolSpec {
    CATALOG
        .iter()
        .find(|spec| spec.name == name)
        .unwrap_or_else(|| unreachable!("catalog is missing {name}"))
}

/// Wire names of every catalog entry, used as the step schema's `tool` enum.
pub fn tool_names() -> Vec<&'static str> {
    CATALOG.iter().map(|spec| spec.name.as_str()).collect()
}

/// Human-readable catalog summary embedded into oracle prompts and `taskrunner tools`.
pub fn render_catalog() -> String {
    let mut buf = String::new();
    for spec in catalog() {
        buf.push_str(&format!("- {}: {}\n", spec.name, spec.description));
        for param in spec.params {
            let required = if param.required { "required" } else { "optional" };
            buf.push_str(&format!(
                "    {} ({:?}, {required}): {}\n",
                param.name, param.kind, param.description
            ));
        }
        let retry = if spec.retryable {
            "may be retried after a failure"
        } else {
            "inspect the file before retrying"
        };
        buf.push_str(&format!("    retry: {retry}\n"));
        buf.push_str(&format!("    example: {}\n", spec.example));
    }
    buf
}
