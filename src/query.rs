//! Filtered, ordered, paginated reads over one project version.
//!
//! Every field named by a filter or by `order_by` is checked against the
//! columns of the version's table before it reaches SQL; values are always
//! bound. Conditions are AND-combined behind a fixed
//! `version = ? AND project_id = ?` prefix.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{FieldDefinition, Record};
use crate::projects;
use crate::registry::{data_unit_name, Registry};
use crate::rows::{push_value, RowDecoder, SqlValue};
use crate::schema::{quote_ident, DATA_TABLE};

/// Columns present in every data table and open to filtering.
const SYSTEM_COLUMNS: [&str; 3] = ["id", "project_id", "version"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "IN")]
    In,
}

impl FilterOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Ge => ">=",
            FilterOp::Le => "<=",
            FilterOp::Like => "LIKE",
            FilterOp::In => "IN",
        }
    }
}

impl FromStr for FilterOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "=" | "==" => Ok(FilterOp::Eq),
            "!=" | "<>" => Ok(FilterOp::Ne),
            ">" => Ok(FilterOp::Gt),
            "<" => Ok(FilterOp::Lt),
            ">=" => Ok(FilterOp::Ge),
            "<=" => Ok(FilterOp::Le),
            "LIKE" => Ok(FilterOp::Like),
            "IN" => Ok(FilterOp::In),
            other => Err(Error::validation(format!("unknown filter operator '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOp,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub values: Vec<Value>,
}

fn parse_literal(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

impl Filter {
    /// Parses `field op value`, e.g. `age >= 30` or `city IN oslo,bergen`.
    ///
    /// The value is read as a JSON literal when it parses as one, otherwise as
    /// a plain string.
    pub fn parse(expr: &str) -> Result<Self> {
        let mut parts = expr.trim().splitn(3, char::is_whitespace);
        let field = parts.next().unwrap_or_default().to_string();
        let op = parts
            .next()
            .ok_or_else(|| Error::validation(format!("filter '{}' has no operator", expr)))?;
        let operator: FilterOp = op.parse()?;
        let raw = parts.next().map(str::trim).unwrap_or_default();

        let mut filter = Filter {
            field,
            operator,
            value: None,
            values: Vec::new(),
        };
        if operator == FilterOp::In {
            filter.values = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_literal)
                .collect();
        } else if !raw.is_empty() {
            filter.value = Some(parse_literal(raw));
        }
        Ok(filter)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub project_id: String,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl QueryRequest {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub data: Vec<Record>,
    pub total: i64,
    pub version: i64,
}

/// A request checked against one version's columns, ready to render.
#[derive(Debug)]
pub struct QueryPlan<'r> {
    request: &'r QueryRequest,
    project_id: String,
    version: i64,
}

impl<'r> QueryPlan<'r> {
    pub fn new(
        request: &'r QueryRequest,
        fields: &[FieldDefinition],
        project_id: &str,
        version: i64,
    ) -> Result<Self> {
        let columns: HashSet<&str> = SYSTEM_COLUMNS
            .iter()
            .copied()
            .chain(fields.iter().map(|f| f.key.as_str()))
            .collect();
        let known = |name: &str| -> Result<()> {
            if columns.contains(name) {
                Ok(())
            } else {
                Err(Error::validation(format!("unknown field '{}'", name)))
            }
        };

        for filter in &request.filters {
            known(&filter.field)?;
            match filter.operator {
                FilterOp::In if filter.values.is_empty() => {
                    return Err(Error::validation(format!(
                        "IN filter on '{}' needs at least one value",
                        filter.field
                    )));
                }
                FilterOp::In => {}
                _ if filter.value.as_ref().map_or(true, Value::is_null) => {
                    return Err(Error::validation(format!(
                        "{} filter on '{}' needs a value",
                        filter.operator.as_sql(),
                        filter.field
                    )));
                }
                _ => {}
            }
        }
        if let Some(order_by) = &request.order_by {
            known(order_by)?;
        }
        if request.limit.is_some_and(|l| l < 0) || request.offset.is_some_and(|o| o < 0) {
            return Err(Error::validation("limit and offset must not be negative"));
        }

        Ok(Self {
            request,
            project_id: project_id.to_string(),
            version,
        })
    }

    fn push_where(&self, builder: &mut QueryBuilder<'static, Sqlite>) {
        builder.push(" WHERE version = ");
        builder.push_bind(self.version);
        builder.push(" AND project_id = ");
        builder.push_bind(self.project_id.clone());

        for filter in &self.request.filters {
            builder.push(" AND ");
            builder.push(quote_ident(&filter.field));
            builder.push(" ");
            builder.push(filter.operator.as_sql());
            builder.push(" ");
            match filter.operator {
                FilterOp::In => {
                    builder.push("(");
                    for (i, value) in filter.values.iter().enumerate() {
                        if i > 0 {
                            builder.push(", ");
                        }
                        push_value(builder, SqlValue::from_json(value));
                    }
                    builder.push(")");
                }
                FilterOp::Like => {
                    let needle = match &filter.value {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    builder.push_bind(format!("%{}%", needle));
                }
                _ => {
                    let value = filter.value.as_ref().unwrap_or(&Value::Null);
                    push_value(builder, SqlValue::from_json(value));
                }
            }
        }
    }

    pub fn count(&self) -> QueryBuilder<'static, Sqlite> {
        let mut builder = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", DATA_TABLE));
        self.push_where(&mut builder);
        builder
    }

    pub fn select(&self) -> QueryBuilder<'static, Sqlite> {
        let mut builder = QueryBuilder::new(format!("SELECT * FROM {}", DATA_TABLE));
        self.push_where(&mut builder);

        match &self.request.order_by {
            Some(field) => {
                builder.push(" ORDER BY ");
                builder.push(quote_ident(field));
                builder.push(" ");
                builder.push(self.request.order.as_sql());
            }
            None => {
                builder.push(" ORDER BY id DESC");
            }
        }

        // SQLite only accepts OFFSET after a LIMIT.
        if let Some(limit) = self.request.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
            if let Some(offset) = self.request.offset {
                builder.push(" OFFSET ");
                builder.push_bind(offset);
            }
        }
        builder
    }
}

/// Runs `request` against the requested (or current) version of a project.
pub async fn query(registry: &Registry, request: &QueryRequest) -> Result<QueryResult> {
    let project = projects::find(registry, &request.project_id).await?;
    let version = request.version.unwrap_or(project.version);

    let unit = data_unit_name(&project.id, version);
    if !registry.unit_exists(&unit).await? {
        return Err(Error::not_found(format!(
            "project {} has no data for version {}",
            project.id, version
        )));
    }

    let fields = projects::fields_for_version(registry, &project, version).await?;
    let plan = QueryPlan::new(request, &fields, &project.id, version)?;
    let pool = registry.resolve(&unit).await?;

    let total = plan
        .count()
        .build_query_scalar::<i64>()
        .fetch_one(&pool)
        .await?;
    let rows = plan.select().build().fetch_all(&pool).await?;

    let decoder = RowDecoder::for_fields(&fields);
    let data = rows
        .iter()
        .map(|row| decoder.decode(row))
        .collect::<Result<Vec<_>>>()?;

    debug!(project = %project.id, version, total, returned = data.len(), "query served");
    Ok(QueryResult {
        data,
        total,
        version,
    })
}

/// Versions of a project that can be queried.
pub async fn list_versions(registry: &Registry, project_id: &str) -> Result<Vec<i64>> {
    projects::available_versions(registry, project_id).await
}
