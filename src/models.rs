//! Core data models used throughout datamix.
//!
//! These types describe projects (crawl targets with an evolving response
//! schema), their field definitions and request templates, and the tasks that
//! execute the fetch-extract-dedup-persist cycle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// One crawled row, keyed by field name. Shape is only known at runtime.
pub type Record = Map<String, Value>;

/// Logical field type, shared by response fields and request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Textarea,
    Number,
    Decimal,
    Boolean,
    Select,
    Multiselect,
    Checkbox,
    Radio,
    Date,
    Datetime,
    Time,
    Email,
    Url,
    Uuid,
    Json,
    Array,
}

impl FieldType {
    pub const ALL: [FieldType; 17] = [
        FieldType::Text,
        FieldType::Textarea,
        FieldType::Number,
        FieldType::Decimal,
        FieldType::Boolean,
        FieldType::Select,
        FieldType::Multiselect,
        FieldType::Checkbox,
        FieldType::Radio,
        FieldType::Date,
        FieldType::Datetime,
        FieldType::Time,
        FieldType::Email,
        FieldType::Url,
        FieldType::Uuid,
        FieldType::Json,
        FieldType::Array,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Textarea => "textarea",
            FieldType::Number => "number",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Select => "select",
            FieldType::Multiselect => "multiselect",
            FieldType::Checkbox => "checkbox",
            FieldType::Radio => "radio",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Time => "time",
            FieldType::Email => "email",
            FieldType::Url => "url",
            FieldType::Uuid => "uuid",
            FieldType::Json => "json",
            FieldType::Array => "array",
        }
    }

    /// Types whose fields pick from an options list.
    pub fn is_choice(&self) -> bool {
        matches!(self, FieldType::Select | FieldType::Checkbox | FieldType::Radio)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FieldType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                let supported: Vec<&str> = FieldType::ALL.iter().map(|t| t.as_str()).collect();
                Error::validation(format!(
                    "unsupported field type '{}'. Supported: {}",
                    s,
                    supported.join(", ")
                ))
            })
    }
}

fn default_true() -> bool {
    true
}

/// One column of a project's response schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub primary: bool,
    /// SQL literal copied verbatim into the column's DEFAULT clause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl FieldDefinition {
    pub fn new(key: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            key: key.into(),
            field_type,
            nullable: true,
            primary: false,
            default: None,
            unique: false,
            length: None,
            options: None,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// GET-like methods carry parameters in the query string.
    pub fn sends_query(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Delete)
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(Error::validation(format!(
                "unsupported HTTP method '{}'. Must be GET, POST, PUT or DELETE",
                other
            ))),
        }
    }
}

/// Project-level request parameter template entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParam {
    pub key: String,
    #[serde(rename = "type")]
    pub param_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    /// Persist this parameter's merged value as a column on every row.
    #[serde(default)]
    pub save_to_database: bool,
}

/// Task-level override of a request parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParam {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub param_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl TaskParam {
    pub fn value(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            param_type: None,
            default: None,
        }
    }
}

/// Input for creating a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDefinition {
    pub name: String,
    pub api_url: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub request_params: Vec<RequestParam>,
    pub response_structure: Vec<FieldDefinition>,
    /// Keys leading from the response root to the record list.
    #[serde(default)]
    pub target_chain: Vec<String>,
}

impl ProjectDefinition {
    /// Parses a definition, reporting unknown types or methods as validation errors.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::validation(e.to_string()))
    }
}

/// Partial update of a project. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub request_params: Option<Vec<RequestParam>>,
    #[serde(default)]
    pub response_structure: Option<Vec<FieldDefinition>>,
    #[serde(default)]
    pub target_chain: Option<Vec<String>>,
}

impl ProjectPatch {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::validation(e.to_string()))
    }
}

/// A configured crawl target stored in the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub api_url: String,
    pub method: HttpMethod,
    pub request_params: Vec<RequestParam>,
    pub response_structure: Vec<FieldDefinition>,
    pub target_chain: Vec<String>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::validation(format!("unknown task status '{}'", other))),
        }
    }
}

/// One execution attempt of a project's crawl cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub status: TaskStatus,
    pub request_params: Vec<TaskParam>,
    /// Schema version captured when the task was created.
    pub version: i64,
    pub result_count: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
}
