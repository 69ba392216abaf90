use crate::application::store::StoreError;

/// Suffix of the partial unique indexes created by `ensure_table`.
pub(crate) const UNIQUE_INDEX_SUFFIX: &str = "__uniq";

pub(crate) fn unique_index_name(table: &str, field: &str) -> String {
    format!("{table}__{field}{UNIQUE_INDEX_SUFFIX}")
}

pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db) if db.message().contains("duplicate key") => {
            let constraint = db.constraint().unwrap_or("unknown");
            let (table, field) = split_unique_index(constraint);
            StoreError::Duplicate { table, field }
        }
        sqlx::Error::Database(db)
            if db.message().contains("violates foreign key constraint")
                || db.message().contains("invalid input syntax") =>
        {
            StoreError::InvalidInput(db.message().to_string())
        }
        sqlx::Error::Database(db) if db.message().contains("violates") => {
            StoreError::Integrity(db.message().to_string())
        }
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            StoreError::Timeout
        }
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::from_persistence(other),
    }
}

/// Recover `(table, field)` from a unique index name.
fn split_unique_index(constraint: &str) -> (String, String) {
    constraint
        .strip_suffix(UNIQUE_INDEX_SUFFIX)
        .and_then(|stem| stem.split_once("__"))
        .map(|(table, field)| (table.to_string(), field.to_string()))
        .unwrap_or_else(|| (String::new(), constraint.to_string()))
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<&str, StoreError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63;
    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidInput(format!(
            "`{name}` is not a valid identifier"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_index_names_round_trip_to_table_and_field() {
        let name = unique_index_name("users", "email");
        assert_eq!(
            split_unique_index(&name),
            ("users".to_string(), "email".to_string())
        );
        assert_eq!(
            split_unique_index("users_pkey"),
            (String::new(), "users_pkey".to_string())
        );
    }

    #[test]
    fn identifiers_reject_quotes_and_spaces() {
        assert!(validate_identifier("user_groups").is_ok());
        assert!(validate_identifier("_hidden1").is_ok());
        assert!(validate_identifier("1users").is_err());
        assert!(validate_identifier("users\"; drop").is_err());
        assert!(validate_identifier("").is_err());
    }
}
