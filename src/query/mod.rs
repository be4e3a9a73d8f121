//! Engine-agnostic filter DSL.
//!
//! A [`QuerySpec`] is a list of AND-combined [`FilterCondition`]s, an ordered
//! list of [`SortSpec`]s and an optional projection. There is no OR and no
//! grouping; every adapter implements exactly the operators in [`Operator`].

pub mod eval;

use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::record::Value;
use crate::schema::SchemaDescriptor;

/// Comparison operators. This set is fixed; adding one means updating every
/// adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "in" => Some(Self::In),
            _ => None,
        }
    }

    /// Range operators are never pushed down on the scan-based engines.
    pub fn is_range(self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }
}

/// Right-hand side of a condition: a scalar for every operator except `in`.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(Value),
    List(Vec<Value>),
}

impl FilterValue {
    pub fn values(&self) -> &[Value] {
        match self {
            Self::Scalar(v) => std::slice::from_ref(v),
            Self::List(values) => values,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterCondition {
    pub field: String,
    pub operator: Operator,
    pub value: FilterValue,
}

impl FilterCondition {
    pub fn new(field: impl Into<String>, operator: Operator, value: FilterValue) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, FilterValue::Scalar(value.into()))
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Ne, FilterValue::Scalar(value.into()))
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Gt, FilterValue::Scalar(value.into()))
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Gte, FilterValue::Scalar(value.into()))
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Lt, FilterValue::Scalar(value.into()))
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Lte, FilterValue::Scalar(value.into()))
    }

    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(
            field,
            Operator::In,
            FilterValue::List(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Check the operator/value shape invariant.
    pub fn validate(&self) -> Result<(), DataError> {
        if self.field.trim().is_empty() {
            return Err(DataError::Validation(
                "filter field must not be empty".to_string(),
            ));
        }
        match (&self.operator, &self.value) {
            (Operator::In, FilterValue::List(values)) => {
                if let Some(bad) = values.iter().find(|v| !v.is_scalar()) {
                    return Err(DataError::Validation(format!(
                        "'in' on '{}' contains a non-scalar {} value",
                        self.field,
                        bad.kind()
                    )));
                }
                Ok(())
            }
            (Operator::In, FilterValue::Scalar(_)) => Err(DataError::Validation(format!(
                "'in' on '{}' requires an array value",
                self.field
            ))),
            (op, FilterValue::List(_)) => Err(DataError::Validation(format!(
                "'{}' on '{}' requires a scalar value",
                op.as_str(),
                self.field
            ))),
            (op, FilterValue::Scalar(value)) => {
                if !value.is_scalar() {
                    return Err(DataError::Validation(format!(
                        "'{}' on '{}' requires a scalar value, got json",
                        op.as_str(),
                        self.field
                    )));
                }
                if op.is_range() && value.is_null() {
                    return Err(DataError::Validation(format!(
                        "'{}' on '{}' cannot compare against null",
                        op.as_str(),
                        self.field
                    )));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Complete logical query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    /// AND-combined; insertion order is irrelevant.
    pub conditions: Vec<FilterCondition>,
    /// Priority follows list order. Empty means no ordering guarantee.
    pub order_by: Vec<SortSpec>,
    pub select: Option<Vec<String>>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for `where id = <id>`.
    pub fn by_id(id: impl Into<String>) -> Self {
        let id: String = id.into();
        Self::new().filter(FilterCondition::eq("id", id))
    }

    pub fn filter(mut self, condition: FilterCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn order_by(mut self, sort: SortSpec) -> Self {
        self.order_by.push(sort);
        self
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Validate value shapes and, when a descriptor is given, that every
    /// referenced field is declared.
    pub fn validate(&self, schema: Option<&SchemaDescriptor>) -> Result<(), DataError> {
        validate_conditions(&self.conditions, schema)?;
        let Some(schema) = schema else {
            return Ok(());
        };
        for sort in &self.order_by {
            schema.require_field(&sort.field)?;
        }
        if let Some(select) = &self.select {
            for field in select {
                schema.require_field(field)?;
            }
        }
        Ok(())
    }
}

/// Validate a bare condition list (used by `update_many`/`delete_many`).
///
/// With a descriptor, every value must also fit the field's type, so no
/// engine is left to coerce or silently mismatch it.
pub fn validate_conditions(
    conditions: &[FilterCondition],
    schema: Option<&SchemaDescriptor>,
) -> Result<(), DataError> {
    for condition in conditions {
        condition.validate()?;
        let Some(schema) = schema else {
            continue;
        };
        let field = schema.require_field(&condition.field)?;
        if let Some(bad) = condition
            .value
            .values()
            .iter()
            .find(|v| !field.field_type.accepts_filter(v))
        {
            return Err(DataError::Validation(format!(
                "'{}' on '{}' expects {}, got {}",
                condition.operator.as_str(),
                condition.field,
                field.field_type.as_str(),
                bad.kind()
            )));
        }
    }
    Ok(())
}
