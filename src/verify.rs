//! Read-only comparison of a live database against the declared schema.
use std::collections::BTreeSet;

use mongodb::{Client, IndexModel, bson::Document};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::{
    provision::{ProvisionError, find_user},
    schema::{RoleGrant, Schema},
    utils::db::{extra_options, list_indexes},
};

#[derive(thiserror::Error, Debug)]
pub enum VerifyError {
    #[error("error from mongodb")]
    Mongodb(#[from] mongodb::error::Error),
    #[error("failed to look up the admin user")]
    User(#[from] ProvisionError),
}

/// Differences between the live database and the declared schema. Indexes are
/// reported as `collection.index_name`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub missing_collections: Vec<String>,
    pub extra_collections: Vec<String>,
    pub missing_indexes: Vec<String>,
    pub mismatched_indexes: Vec<String>,
    pub extra_indexes: Vec<String>,
    pub user_exists: bool,
    pub grants_match: bool,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.missing_collections.is_empty()
            && self.extra_collections.is_empty()
            && self.missing_indexes.is_empty()
            && self.mismatched_indexes.is_empty()
            && self.extra_indexes.is_empty()
            && self.user_exists
            && self.grants_match
    }

    /// One line per finding, empty when the database matches.
    pub fn findings(&self) -> Vec<String> {
        let mut findings = Vec::new();
        let groups = [
            ("missing collection", &self.missing_collections),
            ("unexpected collection", &self.extra_collections),
            ("missing index", &self.missing_indexes),
            ("index with wrong options", &self.mismatched_indexes),
            ("unexpected index", &self.extra_indexes),
        ];
        for (label, items) in groups {
            findings.extend(items.iter().map(|item| format!("{}: {}", label, item)));
        }
        if !self.user_exists {
            findings.push("admin user does not exist".to_string());
        } else if !self.grants_match {
            findings.push("admin user grants differ from the declared roles".to_string());
        }
        findings
    }
}

fn is_id_index(model: &IndexModel) -> bool {
    model.keys.len() == 1 && model.keys.contains_key("_id")
}

fn index_label(collection: &str, model: &IndexModel) -> String {
    let name = model
        .options
        .as_ref()
        .and_then(|options| options.name.clone())
        .unwrap_or_else(|| format!("{:?}", model.keys));
    format!("{}.{}", collection, name)
}

/// Compare the indexes present on one collection with the declared ones.
/// Indexes are matched by key pattern, so a declared index under another
/// name still counts, but only when its options are the declared ones.
fn compare_indexes(
    schema: &Schema,
    collection: &str,
    present: &[IndexModel],
    report: &mut VerifyReport,
) {
    let present: Vec<&IndexModel> = present.iter().filter(|model| !is_id_index(model)).collect();

    for spec in schema.indexes_for(collection) {
        match present.iter().find(|model| spec.matches_index(model)) {
            None => report
                .missing_indexes
                .push(format!("{}.{}", collection, spec.name())),
            Some(model) if !spec.options_match(model) => {
                debug!(
                    index = %index_label(collection, model),
                    extra = ?extra_options(model),
                    "index options differ"
                );
                report
                    .mismatched_indexes
                    .push(format!("{}.{}", collection, spec.name()));
            }
            Some(_) => {}
        }
    }

    for model in &present {
        if !schema.indexes_for(collection).any(|spec| spec.matches_index(model)) {
            report.extra_indexes.push(index_label(collection, model));
        }
    }
}

fn grants_of(user: &Document) -> BTreeSet<RoleGrant> {
    user.get_array("roles")
        .map(|roles| {
            roles
                .iter()
                .filter_map(|role| role.as_document().and_then(RoleGrant::from_document))
                .collect()
        })
        .unwrap_or_default()
}

#[instrument(skip(client, schema), fields(database = %schema.database), err)]
pub async fn verify(
    client: &Client,
    schema: &Schema,
    admin_username: &str,
    auth_database: &str,
) -> Result<VerifyReport, VerifyError> {
    let mut report = VerifyReport::default();
    let db = client.database(&schema.database);

    let present = db.list_collection_names().await?;
    for &name in &schema.collections {
        if !present.iter().any(|p| p == name) {
            report.missing_collections.push(name.to_string());
        }
    }
    report.extra_collections = present
        .iter()
        .filter(|p| {
            !p.starts_with("system.") && !schema.collections.iter().any(|c| *c == p.as_str())
        })
        .cloned()
        .collect();

    for &name in &schema.collections {
        if report.missing_collections.iter().any(|m| m == name) {
            report
                .missing_indexes
                .extend(schema.indexes_for(name).map(|spec| format!("{}.{}", name, spec.name())));
            continue;
        }
        let indexes = list_indexes(&db.collection::<Document>(name)).await?;
        compare_indexes(schema, name, &indexes, &mut report);
    }

    let users = find_user(client, auth_database, admin_username).await?;
    report.user_exists = !users.is_empty();
    report.grants_match = users.first().is_some_and(|user| {
        grants_of(user) == schema.grants.iter().cloned().collect::<BTreeSet<_>>()
    });

    debug!(?report);
    Ok(report)
}
