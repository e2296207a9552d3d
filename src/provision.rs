use mongodb::{
    Client, Database, IndexModel,
    bson::{Document, doc},
};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{
    schema::{AdminPrincipal, IndexSpec, Schema, SchemaError},
    utils::{
        db::{CreateIndexError, codes, create_index, error_code, list_indexes},
        enums::ExistingPolicy,
    },
};

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("invalid schema")]
    Schema(#[from] SchemaError),
    #[error("error from mongodb")]
    Mongodb(#[from] mongodb::error::Error),
    #[error("failed to create index {index} on {collection}")]
    CreateIndex {
        collection: String,
        index: String,
        #[source]
        source: CreateIndexError,
    },
    #[error("index {index} on {collection} conflicts with existing index {existing}")]
    IndexConflict {
        collection: String,
        index: String,
        existing: String,
    },
    #[error("server rejected index {index} on {collection} as conflicting with an existing one")]
    IndexRejected {
        collection: String,
        index: String,
        #[source]
        source: CreateIndexError,
    },
    #[error("user {username} already exists in {database}")]
    UserExists { username: String, database: String },
    #[error("collection {0} already exists")]
    CollectionExists(String),
    #[error("index {index} already exists on {collection}")]
    IndexExists { collection: String, index: String },
    #[error("unexpected usersInfo reply")]
    UsersInfoReply(#[from] mongodb::bson::document::ValueAccessError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserOutcome {
    Created,
    Updated,
}

/// What a provisioning run did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProvisionSummary {
    pub user: UserOutcome,
    pub collections_created: Vec<String>,
    pub collections_existing: Vec<String>,
    pub indexes_applied: Vec<String>,
    pub indexes_existing: Vec<String>,
}

/// Whether `username` is defined in `database`.
pub async fn user_exists(
    client: &Client,
    database: &str,
    username: &str,
) -> Result<bool, ProvisionError> {
    Ok(!find_user(client, database, username).await?.is_empty())
}

pub(crate) async fn find_user(
    client: &Client,
    database: &str,
    username: &str,
) -> Result<Vec<Document>, ProvisionError> {
    let reply = client
        .database(database)
        .run_command(doc! { "usersInfo": { "user": username, "db": database } })
        .await?;
    let users = reply
        .get_array("users")?
        .iter()
        .filter_map(|user| user.as_document().cloned())
        .collect();
    Ok(users)
}

/// Brings a server to the declared state: admin user, collections, indexes,
/// in that order. The first error aborts the run; nothing is rolled back.
pub struct Provisioner<'a> {
    client: &'a Client,
    schema: &'a Schema,
    admin: &'a AdminPrincipal,
    policy: ExistingPolicy,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        client: &'a Client,
        schema: &'a Schema,
        admin: &'a AdminPrincipal,
        policy: ExistingPolicy,
    ) -> Self {
        Provisioner {
            client,
            schema,
            admin,
            policy,
        }
    }

    #[instrument(skip(self), fields(database = %self.schema.database, policy = %self.policy), err)]
    pub async fn run(&self) -> Result<ProvisionSummary, ProvisionError> {
        self.schema.validate()?;

        let user = self.ensure_admin_user().await?;

        let db = self.client.database(&self.schema.database);
        let (collections_created, collections_existing) = self.ensure_collections(&db).await?;
        let (indexes_applied, indexes_existing) = self.ensure_indexes(&db).await?;

        info!(
            ?user,
            created = collections_created.len(),
            existing = collections_existing.len(),
            indexes = indexes_applied.len(),
            indexes_existing = indexes_existing.len(),
            "provisioning complete"
        );
        Ok(ProvisionSummary {
            user,
            collections_created,
            collections_existing,
            indexes_applied,
            indexes_existing,
        })
    }

    #[instrument(skip(self), fields(username = %self.admin.username), err)]
    async fn ensure_admin_user(&self) -> Result<UserOutcome, ProvisionError> {
        let auth_db = self.client.database(&self.admin.auth_database);

        if user_exists(self.client, &self.admin.auth_database, &self.admin.username).await? {
            return self.on_existing_user(&auth_db).await;
        }

        let command = doc! {
            "createUser": self.admin.username.as_str(),
            "pwd": self.admin.password.expose(),
            "roles": self.admin.roles(),
        };
        match auth_db.run_command(command).await {
            Ok(_) => {
                info!("admin user created");
                Ok(UserOutcome::Created)
            }
            // someone else created it between the lookup and the create
            Err(e) if error_code(&e) == Some(codes::USER_ALREADY_EXISTS) => {
                self.on_existing_user(&auth_db).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_existing_user(&self, auth_db: &Database) -> Result<UserOutcome, ProvisionError> {
        match self.policy {
            ExistingPolicy::Fail => Err(ProvisionError::UserExists {
                username: self.admin.username.clone(),
                database: self.admin.auth_database.clone(),
            }),
            ExistingPolicy::Reconcile => {
                // roles are replaced wholesale, so stale grants are dropped too
                let command = doc! {
                    "updateUser": self.admin.username.as_str(),
                    "pwd": self.admin.password.expose(),
                    "roles": self.admin.roles(),
                };
                auth_db.run_command(command).await?;
                info!("admin user already existed, password and roles updated");
                Ok(UserOutcome::Updated)
            }
        }
    }

    #[instrument(skip_all, err)]
    async fn ensure_collections(
        &self,
        db: &Database,
    ) -> Result<(Vec<String>, Vec<String>), ProvisionError> {
        let present = db.list_collection_names().await?;
        let mut created = Vec::new();
        let mut existing = Vec::new();

        for &name in &self.schema.collections {
            if present.iter().any(|p| p == name) {
                if self.policy == ExistingPolicy::Fail {
                    return Err(ProvisionError::CollectionExists(name.to_string()));
                }
                info!(collection = name, "collection already exists");
                existing.push(name.to_string());
                continue;
            }
            match db.create_collection(name).await {
                Ok(()) => {
                    info!(collection = name, "collection created");
                    created.push(name.to_string());
                }
                Err(e) if error_code(&e) == Some(codes::NAMESPACE_EXISTS) => {
                    if self.policy == ExistingPolicy::Fail {
                        return Err(ProvisionError::CollectionExists(name.to_string()));
                    }
                    warn!(collection = name, "collection appeared while provisioning");
                    existing.push(name.to_string());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok((created, existing))
    }

    /// Existing indexes are matched by key pattern, not by name, so one
    /// created by hand under another name is recognized.
    #[instrument(skip_all, err)]
    async fn ensure_indexes(
        &self,
        db: &Database,
    ) -> Result<(Vec<String>, Vec<String>), ProvisionError> {
        let mut applied = Vec::new();
        let mut existing = Vec::new();
        for &name in &self.schema.collections {
            let collection = db.collection::<Document>(name);
            let specs: Vec<&IndexSpec> = self.schema.indexes_for(name).collect();
            if specs.is_empty() {
                continue;
            }
            let present = list_indexes(&collection).await?;

            for spec in specs {
                match index_action(spec, &present, self.policy)? {
                    IndexAction::Create => {
                        create_index(&collection, spec.keys_document(), spec.unique)
                            .await
                            .map_err(|source| index_error(spec, source))?;
                        applied.push(format!("{}.{}", name, spec.name()));
                    }
                    IndexAction::Existing(index) => {
                        info!(collection = name, index = %index, "index already exists");
                        existing.push(format!("{}.{}", name, index));
                    }
                }
            }
        }
        Ok((applied, existing))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum IndexAction {
    Create,
    /// Already present under this name.
    Existing(String),
}

fn index_action(
    spec: &IndexSpec,
    present: &[IndexModel],
    policy: ExistingPolicy,
) -> Result<IndexAction, ProvisionError> {
    let Some(model) = present.iter().find(|model| spec.matches_index(model)) else {
        return Ok(IndexAction::Create);
    };
    let existing = index_name(model);
    if policy == ExistingPolicy::Fail {
        return Err(ProvisionError::IndexExists {
            collection: spec.collection.to_string(),
            index: existing,
        });
    }
    if !spec.options_match(model) {
        return Err(ProvisionError::IndexConflict {
            collection: spec.collection.to_string(),
            index: spec.name(),
            existing,
        });
    }
    Ok(IndexAction::Existing(existing))
}

fn index_name(model: &IndexModel) -> String {
    model
        .options
        .as_ref()
        .and_then(|options| options.name.clone())
        .unwrap_or_else(|| model.keys.keys().cloned().collect::<Vec<_>>().join("_"))
}

fn index_error(spec: &IndexSpec, source: CreateIndexError) -> ProvisionError {
    let collection = spec.collection.to_string();
    let index = spec.name();
    match source.code() {
        Some(codes::INDEX_OPTIONS_CONFLICT) | Some(codes::INDEX_KEY_SPECS_CONFLICT) => {
            ProvisionError::IndexRejected {
                collection,
                index,
                source,
            }
        }
        _ => ProvisionError::CreateIndex {
            collection,
            index,
            source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Direction, REQUESTS};
    use mongodb::options::IndexOptions;

    const REQUEST_ID: IndexSpec =
        IndexSpec::new(REQUESTS, &[("request_id", Direction::Ascending)], true);

    fn existing(name: &str, options: IndexOptions) -> IndexModel {
        let mut options = options;
        options.name = Some(name.to_string());
        IndexModel::builder()
            .keys(doc! { "request_id": 1 })
            .options(options)
            .build()
    }

    fn unique() -> IndexOptions {
        IndexOptions::builder().unique(true).build()
    }

    #[test]
    fn test_index_action_create_when_absent() {
        let present = [IndexModel::builder().keys(doc! { "_id": 1 }).build()];
        let action = index_action(&REQUEST_ID, &present, ExistingPolicy::Reconcile).unwrap();
        assert_eq!(action, IndexAction::Create);
    }

    #[test]
    fn test_index_action_matches_by_keys() {
        let present = [existing("req_uniq", unique())];
        let action = index_action(&REQUEST_ID, &present, ExistingPolicy::Reconcile).unwrap();
        assert_eq!(action, IndexAction::Existing("req_uniq".to_string()));
    }

    #[test]
    fn test_index_action_fail_policy_on_renamed_index() {
        let present = [existing("req_uniq", unique())];
        let result = index_action(&REQUEST_ID, &present, ExistingPolicy::Fail);
        assert!(matches!(
            result,
            Err(ProvisionError::IndexExists { ref index, .. }) if index == "req_uniq"
        ));
    }

    #[test]
    fn test_index_action_uniqueness_conflict() {
        let present = [existing("request_id_1", IndexOptions::default())];
        let result = index_action(&REQUEST_ID, &present, ExistingPolicy::Reconcile);
        assert!(matches!(
            result,
            Err(ProvisionError::IndexConflict { ref existing, .. }) if existing == "request_id_1"
        ));
    }

    #[test]
    fn test_index_action_extra_options_conflict() {
        let sparse = IndexOptions::builder().unique(true).sparse(true).build();
        let present = [existing("request_id_1", sparse)];
        let result = index_action(&REQUEST_ID, &present, ExistingPolicy::Reconcile);
        assert!(matches!(result, Err(ProvisionError::IndexConflict { .. })));
    }
}
