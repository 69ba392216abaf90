//! Static description of a model: its columns, relations and hidden rows.
//!
//! Every model publishes one [`Schema`]. The pipeline reads it to decide which
//! query parameters are filters, how to compare and sort columns, which
//! fields are unique, which relations can be expanded and which sentinel rows
//! never appear in list results. The base columns are implicit.

use serde_json::Value;

use super::base;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Int,
    Float,
    Bool,
    Time,
    Json,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Bool => "bool",
            FieldKind::Time => "time",
            FieldKind::Json => "json",
        }
    }

    /// Whether `value` is the zero value of this kind.
    ///
    /// Null always counts as zero.
    pub fn is_zero(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldKind::String | FieldKind::Time, Value::String(s)) => s.is_empty(),
            (FieldKind::Int | FieldKind::Float, Value::Number(n)) => n.as_f64() == Some(0.0),
            (FieldKind::Bool, Value::Bool(b)) => !b,
            (FieldKind::Json, Value::Array(items)) => items.is_empty(),
            (FieldKind::Json, Value::Object(map)) => map.is_empty(),
            _ => false,
        }
    }
}

/// A declared column.
///
/// `optional` fields are `Option<_>` on the model: a present zero value is
/// meaningful for filters and partial updates. Non-optional fields treat
/// their zero value as "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub optional: bool,
    pub filterable: bool,
    pub unique: bool,
}

impl Field {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            optional: false,
            filterable: false,
            unique: false,
        }
    }

    pub const fn string(name: &'static str) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub const fn int(name: &'static str) -> Self {
        Self::new(name, FieldKind::Int)
    }

    pub const fn float(name: &'static str) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub const fn bool(name: &'static str) -> Self {
        Self::new(name, FieldKind::Bool)
    }

    pub const fn time(name: &'static str) -> Self {
        Self::new(name, FieldKind::Time)
    }

    pub const fn json(name: &'static str) -> Self {
        Self::new(name, FieldKind::Json)
    }

    pub const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub const fn filterable(mut self) -> Self {
        self.filterable = true;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Whether `value` carries information under the optional/zero rule.
    pub fn is_set(&self, value: &Value) -> bool {
        if self.optional {
            !value.is_null()
        } else {
            !self.kind.is_zero(value)
        }
    }
}

const BASE_FIELDS: [Field; 8] = [
    Field::string(base::ID).filterable(),
    Field::string(base::CREATED_BY).filterable(),
    Field::string(base::UPDATED_BY).filterable(),
    Field::time(base::CREATED_AT),
    Field::time(base::UPDATED_AT),
    Field::time(base::DELETED_AT).optional(),
    Field::string(base::REMARK).optional(),
    Field::int(base::ORDER).optional(),
];

/// Link from one model to rows of another table.
///
/// A to-one relation matches `target.foreign_field == self.local_field`
/// (usually `foreign_field = "id"`); a to-many relation collects every target
/// row whose `foreign_field` equals `self.local_field` (usually `"id"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    pub name: &'static str,
    pub target: &'static str,
    pub local_field: &'static str,
    pub foreign_field: &'static str,
    pub many: bool,
}

impl Relation {
    pub const fn belongs_to(
        name: &'static str,
        target: &'static str,
        local_field: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            local_field,
            foreign_field: base::ID,
            many: false,
        }
    }

    pub const fn has_many(
        name: &'static str,
        target: &'static str,
        foreign_field: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            local_field: base::ID,
            foreign_field,
            many: true,
        }
    }
}

/// Rows whose `field` holds one of `values` are hidden from list results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    pub field: &'static str,
    pub values: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub table: Option<&'static str>,
    pub fields: Vec<Field>,
    pub relations: Vec<Relation>,
    pub exclusions: Vec<Exclusion>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: &'static str) -> Self {
        self.table = Some(table);
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn exclude(mut self, field: &'static str, values: &[&'static str]) -> Self {
        self.exclusions.push(Exclusion {
            field,
            values: values.to_vec(),
        });
        self
    }

    /// Look up a declared or base column.
    pub fn column(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .chain(BASE_FIELDS.iter())
            .find(|field| field.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Column usable as a query-string filter.
    pub fn filter_field(&self, name: &str) -> Option<&Field> {
        self.column(name).filter(|field| field.filterable)
    }

    pub fn relation_named(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|relation| relation.name == name)
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|field| field.unique)
    }

    pub fn base_fields() -> &'static [Field] {
        &BASE_FIELDS
    }

    /// True when the model declares nothing beyond the base record.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.relations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new()
            .field(Field::string("name").filterable())
            .field(Field::string("email").optional().filterable().unique())
            .field(Field::int("age"))
            .relation(Relation::belongs_to("group", "groups", "group_id"))
            .exclude("name", &["root"])
    }

    #[test]
    fn base_columns_are_implicit() {
        let schema = schema();
        assert_eq!(schema.column("created_at").map(|f| f.kind), Some(FieldKind::Time));
        assert!(schema.filter_field("id").is_some());
        assert!(schema.filter_field("age").is_none());
        assert!(schema.column("group").is_none());
    }

    #[test]
    fn optional_fields_treat_zero_as_set() {
        let schema = schema();
        let email = schema.column("email").expect("email");
        let name = schema.column("name").expect("name");
        assert!(email.is_set(&json!("")));
        assert!(!email.is_set(&Value::Null));
        assert!(!name.is_set(&json!("")));
        assert!(name.is_set(&json!("u1")));
        assert!(!schema.column("age").expect("age").is_set(&json!(0)));
    }

    #[test]
    fn empty_schema_is_detected() {
        assert!(Schema::new().is_empty());
        assert!(!schema().is_empty());
        assert_eq!(schema().unique_fields().count(), 1);
    }
}
