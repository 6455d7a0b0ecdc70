use tokio_postgres::types::{Kind, Type};

/// Converts a type OID to a [`Type`], creating an unnamed simple type for unknown OIDs.
pub fn convert_type_oid_to_type(type_oid: u32) -> Type {
    Type::from_oid(type_oid).unwrap_or(Type::new(
        format!("unnamed_type({type_oid})"),
        type_oid,
        Kind::Simple,
        "pg_catalog".to_string(),
    ))
}

/// Returns `true` for the integer types usable as numeric range bounds.
pub fn is_integer_type(typ: &Type) -> bool {
    matches!(*typ, Type::INT2 | Type::INT4 | Type::INT8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_oids_become_unnamed_types() {
        assert_eq!(convert_type_oid_to_type(Type::INT8.oid()), Type::INT8);

        let unknown = convert_type_oid_to_type(999_999);
        assert_eq!(unknown.name(), "unnamed_type(999999)");
        assert!(!is_integer_type(&unknown));
    }

    #[test]
    fn only_integer_types_are_range_keys() {
        assert!(is_integer_type(&Type::INT2));
        assert!(is_integer_type(&Type::INT4));
        assert!(is_integer_type(&Type::INT8));
        assert!(!is_integer_type(&Type::NUMERIC));
        assert!(!is_integer_type(&Type::UUID));
    }
}
