//! Process-wide lookup of type schemas by `typename`.
//!
//! Initialized on first use with the built-in types. Lookups hand out `Arc`s, so registering a
//! replacement never invalidates schemas already resolved by a live comm.

use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde_json::Value;

use super::{BytesType, JsonType, ScalarType, TypeDef, TypeSchema, TYPENAME_KEY};
use crate::error::TypeError;

fn registry() -> &'static RwLock<HashMap<&'static str, Arc<dyn TypeSchema>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, Arc<dyn TypeSchema>>>> =
        OnceLock::new();

    REGISTRY.get_or_init(|| {
        let builtins: [Arc<dyn TypeSchema>; 3] =
            [Arc::new(BytesType), Arc::new(JsonType), Arc::new(ScalarType)];
        RwLock::new(builtins.into_iter().map(|t| (t.name(), t)).collect())
    })
}

/// Registers a type under its name, returning the schema it replaced.
pub fn register_type(schema: Arc<dyn TypeSchema>) -> Option<Arc<dyn TypeSchema>> {
    registry().write().insert(schema.name(), schema)
}

pub fn get_type(typename: &str) -> Result<Arc<dyn TypeSchema>, TypeError> {
    registry()
        .read()
        .get(typename)
        .cloned()
        .ok_or_else(|| TypeError::UnknownType(typename.into()))
}

/// Resolves the schema named by a definition's `typename` and validates the definition with it.
pub fn validate_typedef(typedef: &TypeDef) -> Result<Arc<dyn TypeSchema>, TypeError> {
    let typename = typedef
        .get(TYPENAME_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| TypeError::UnknownType(String::new()))?;

    let schema = get_type(typename)?;
    schema.validate_definition(typedef)?;
    Ok(schema)
}
