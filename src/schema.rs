//! Declared state of the eyeglass recommendation database.
//!
//! Everything the provisioner creates is listed here: the collections, the
//! secondary indexes on them, and the grants held by the administrative user.
//! Nothing in this module talks to the server.
use mongodb::{
    IndexModel,
    bson::{Bson, Document, doc},
};
use serde::Serialize;

use crate::conf::{AppConfig, ConfError, Secret};
use crate::utils::db::{extra_options, is_unique, key_pattern};
pub use crate::utils::enums::Direction;

pub const DATABASE_NAME: &str = "eyeglass_recommendation";
pub const ADMIN_USERNAME: &str = "eyeglass_admin";

pub const REQUESTS: &str = "requests";
pub const ANALYSIS_RESULTS: &str = "analysis_results";
pub const RECOMMENDATIONS: &str = "recommendations";
pub const WOOCOMMERCE_CACHE: &str = "woocommerce_cache";

pub const COLLECTIONS: [&str; 4] = [REQUESTS, ANALYSIS_RESULTS, RECOMMENDATIONS, WOOCOMMERCE_CACHE];

/// Roles granted to the administrative user on the target database.
pub const ADMIN_ROLES: [&str; 2] = ["readWrite", "dbAdmin"];

const ASC: Direction = Direction::Ascending;
const DESC: Direction = Direction::Descending;

pub const INDEXES: [IndexSpec; 18] = [
    IndexSpec::new(REQUESTS, &[("request_id", ASC)], true),
    IndexSpec::new(REQUESTS, &[("created_at", ASC)], false),
    IndexSpec::new(REQUESTS, &[("client_info.device_type", ASC)], false),
    IndexSpec::new(REQUESTS, &[("client_info.browser_name", ASC)], false),
    IndexSpec::new(REQUESTS, &[("client_info.os_name", ASC)], false),
    IndexSpec::new(REQUESTS, &[("status_code", ASC)], false),
    IndexSpec::new(ANALYSIS_RESULTS, &[("user_id", ASC)], false),
    IndexSpec::new(ANALYSIS_RESULTS, &[("request_id", ASC)], false),
    IndexSpec::new(ANALYSIS_RESULTS, &[("face_shape", ASC)], false),
    IndexSpec::new(ANALYSIS_RESULTS, &[("created_at", ASC)], false),
    IndexSpec::new(ANALYSIS_RESULTS, &[("confidence", DESC)], false),
    IndexSpec::new(RECOMMENDATIONS, &[("user_id", ASC)], false),
    IndexSpec::new(RECOMMENDATIONS, &[("face_shape", ASC)], false),
    IndexSpec::new(RECOMMENDATIONS, &[("analysis_id", ASC)], false),
    IndexSpec::new(RECOMMENDATIONS, &[("created_at", ASC)], false),
    IndexSpec::new(RECOMMENDATIONS, &[("recommended_frames.match_score", DESC)], false),
    IndexSpec::new(WOOCOMMERCE_CACHE, &[("type", ASC)], true),
    IndexSpec::new(WOOCOMMERCE_CACHE, &[("last_update", ASC)], false),
];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    #[error("index {index} targets undeclared collection {collection}")]
    UnknownCollection { collection: String, index: String },
    #[error("index {index} is declared twice on collection {collection}")]
    DuplicateIndex { collection: String, index: String },
    #[error("an index on collection {0} has no key fields")]
    EmptyKeys(String),
}

/// One secondary index: a key pattern on a collection, optionally unique.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IndexSpec {
    pub collection: &'static str,
    pub keys: &'static [(&'static str, Direction)],
    pub unique: bool,
}

impl IndexSpec {
    pub const fn new(
        collection: &'static str,
        keys: &'static [(&'static str, Direction)],
        unique: bool,
    ) -> Self {
        IndexSpec {
            collection,
            keys,
            unique,
        }
    }

    pub fn keys_document(&self) -> Document {
        self.keys
            .iter()
            .map(|(field, direction)| (field.to_string(), Bson::Int32(direction.as_i32())))
            .collect()
    }

    /// The name the server assigns when none is given, e.g. `confidence_-1`.
    pub fn name(&self) -> String {
        self.keys
            .iter()
            .map(|(field, direction)| format!("{}_{}", field, direction))
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn matches_keys(&self, keys: &[(String, Direction)]) -> bool {
        self.keys.len() == keys.len()
            && self
                .keys
                .iter()
                .zip(keys)
                .all(|((field, direction), (other_field, other_direction))| {
                    *field == other_field.as_str() && direction == other_direction
                })
    }

    /// Whether an existing index has this key pattern, whatever its name.
    pub fn matches_index(&self, model: &IndexModel) -> bool {
        key_pattern(model).is_some_and(|keys| self.matches_keys(&keys))
    }

    /// Whether an existing index with this key pattern has the declared
    /// uniqueness and no other options.
    pub fn options_match(&self, model: &IndexModel) -> bool {
        is_unique(model) == self.unique && extra_options(model).is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RoleGrant {
    pub role: String,
    pub db: String,
}

impl RoleGrant {
    pub fn new(role: &str, db: &str) -> Self {
        RoleGrant {
            role: role.to_string(),
            db: db.to_string(),
        }
    }

    pub fn to_document(&self) -> Document {
        doc! { "role": self.role.as_str(), "db": self.db.as_str() }
    }

    pub fn from_document(document: &Document) -> Option<Self> {
        Some(RoleGrant {
            role: document.get_str("role").ok()?.to_string(),
            db: document.get_str("db").ok()?.to_string(),
        })
    }
}

/// Full declared state for one target database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Schema {
    pub database: String,
    pub collections: Vec<&'static str>,
    pub indexes: Vec<IndexSpec>,
    pub grants: Vec<RoleGrant>,
}

impl Schema {
    pub fn for_database(database: &str) -> Self {
        Schema {
            database: database.to_string(),
            collections: COLLECTIONS.to_vec(),
            indexes: INDEXES.to_vec(),
            grants: ADMIN_ROLES
                .iter()
                .map(|role| RoleGrant::new(role, database))
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        for (i, index) in self.indexes.iter().enumerate() {
            if index.keys.is_empty() {
                return Err(SchemaError::EmptyKeys(index.collection.to_string()));
            }
            if !self.collections.contains(&index.collection) {
                return Err(SchemaError::UnknownCollection {
                    collection: index.collection.to_string(),
                    index: index.name(),
                });
            }
            let duplicate = self.indexes[..i]
                .iter()
                .any(|other| other.collection == index.collection && other.keys == index.keys);
            if duplicate {
                return Err(SchemaError::DuplicateIndex {
                    collection: index.collection.to_string(),
                    index: index.name(),
                });
            }
        }
        Ok(())
    }

    pub fn indexes_for<'a>(&'a self, collection: &'a str) -> impl Iterator<Item = &'a IndexSpec> {
        self.indexes
            .iter()
            .filter(move |index| index.collection == collection)
    }
}

/// The administrative user, with its password already resolved.
#[derive(Clone, Debug)]
pub struct AdminPrincipal {
    pub username: String,
    pub password: Secret,
    /// Database the user is defined in, which clients pass as `authSource`.
    pub auth_database: String,
    pub grants: Vec<RoleGrant>,
}

impl AdminPrincipal {
    pub fn from_config(config: &AppConfig, schema: &Schema) -> Result<Self, ConfError> {
        Ok(AdminPrincipal {
            username: config.admin.username.clone(),
            password: config.admin.password.resolve()?,
            auth_database: config.database.auth_database.clone(),
            grants: schema.grants.clone(),
        })
    }

    pub fn roles(&self) -> Vec<Document> {
        self.grants.iter().map(RoleGrant::to_document).collect()
    }
}
