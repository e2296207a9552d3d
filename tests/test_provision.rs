use std::collections::BTreeSet;

use futures::TryStreamExt;
use mongodb::{
    IndexModel,
    bson::{Document, doc},
    options::IndexOptions,
};

use eyeglass_provision::{
    provision::{ProvisionError, Provisioner, UserOutcome, user_exists},
    schema::{self, Direction},
    utils::{
        db::{is_duplicate_key, list_indexes},
        enums::ExistingPolicy,
        testing::TestDeployment,
    },
    verify::verify,
};

fn suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

async fn provision(
    deployment: &TestDeployment,
    policy: ExistingPolicy,
) -> Result<Vec<String>, ProvisionError> {
    let summary = Provisioner::new(
        &deployment.client,
        &deployment.schema,
        &deployment.admin,
        policy,
    )
    .run()
    .await?;
    Ok(summary.indexes_applied)
}

#[tokio::test]
async fn test_provision_empty_database() {
    let deployment = TestDeployment::new(&suffix()).await;
    let result = Provisioner::new(
        &deployment.client,
        &deployment.schema,
        &deployment.admin,
        ExistingPolicy::Reconcile,
    )
    .run()
    .await;

    let db = deployment.client.database(&deployment.schema.database);
    let collections: BTreeSet<String> = db
        .list_collection_names()
        .await
        .unwrap()
        .into_iter()
        .collect();
    deployment.cleanup().await.unwrap();

    let summary = result.unwrap();
    assert_eq!(summary.user, UserOutcome::Created);
    assert_eq!(summary.collections_created.len(), 4);
    assert!(summary.collections_existing.is_empty());
    assert_eq!(summary.indexes_applied.len(), 18);
    assert!(summary.indexes_existing.is_empty());

    let expected: BTreeSet<String> = schema::COLLECTIONS.iter().map(|c| c.to_string()).collect();
    assert_eq!(collections, expected);
}

#[tokio::test]
async fn test_indexes_created_as_declared() {
    let deployment = TestDeployment::new(&suffix()).await;
    provision(&deployment, ExistingPolicy::Reconcile).await.unwrap();

    let db = deployment.client.database(&deployment.schema.database);
    let mut found = Vec::new();
    for name in schema::COLLECTIONS {
        let indexes = list_indexes(&db.collection::<Document>(name)).await.unwrap();
        for index in indexes {
            let index_name = index.options.as_ref().and_then(|o| o.name.clone()).unwrap();
            if index_name == "_id_" {
                continue;
            }
            let unique = index.options.as_ref().and_then(|o| o.unique).unwrap_or(false);
            found.push((name, index_name, unique, index.keys.clone()));
        }
    }
    deployment.cleanup().await.unwrap();

    assert_eq!(found.len(), 18);
    for spec in schema::INDEXES {
        let (_, _, unique, keys) = found
            .iter()
            .find(|(collection, index_name, _, _)| {
                *collection == spec.collection && *index_name == spec.name()
            })
            .unwrap_or_else(|| panic!("missing index {}", spec.name()));
        assert_eq!(*unique, spec.unique, "uniqueness of {}", spec.name());
        let (field, value) = keys.iter().next().unwrap();
        assert_eq!(field, spec.keys[0].0);
        assert_eq!(Direction::from_bson(value), Some(spec.keys[0].1));
    }
}

#[tokio::test]
async fn test_admin_user_grants() {
    let deployment = TestDeployment::new(&suffix()).await;
    provision(&deployment, ExistingPolicy::Reconcile).await.unwrap();

    let report = verify(
        &deployment.client,
        &deployment.schema,
        &deployment.admin.username,
        &deployment.admin.auth_database,
    )
    .await;
    let reply = deployment
        .client
        .database(&deployment.admin.auth_database)
        .run_command(doc! {
            "usersInfo": { "user": deployment.admin.username.as_str(), "db": deployment.admin.auth_database.as_str() }
        })
        .await;
    deployment.cleanup().await.unwrap();

    let report = report.unwrap();
    assert!(report.user_exists);
    assert!(report.grants_match);

    let reply = reply.unwrap();
    let users = reply.get_array("users").unwrap();
    assert_eq!(users.len(), 1);
    let roles = users[0].as_document().unwrap().get_array("roles").unwrap();
    let roles: BTreeSet<(String, String)> = roles
        .iter()
        .map(|role| {
            let role = role.as_document().unwrap();
            (
                role.get_str("role").unwrap().to_string(),
                role.get_str("db").unwrap().to_string(),
            )
        })
        .collect();
    let db_name = deployment.schema.database.clone();
    assert_eq!(
        roles,
        BTreeSet::from([
            ("dbAdmin".to_string(), db_name.clone()),
            ("readWrite".to_string(), db_name),
        ])
    );
}

#[tokio::test]
async fn test_unique_indexes_enforced() {
    let deployment = TestDeployment::new(&suffix()).await;
    provision(&deployment, ExistingPolicy::Reconcile).await.unwrap();

    let db = deployment.client.database(&deployment.schema.database);

    let requests = db.collection::<Document>(schema::REQUESTS);
    let first_request = requests.insert_one(doc! { "request_id": "req-1" }).await;
    let second_request = requests.insert_one(doc! { "request_id": "req-1" }).await;

    let cache = db.collection::<Document>(schema::WOOCOMMERCE_CACHE);
    let first_cache = cache.insert_one(doc! { "type": "products_cache" }).await;
    let second_cache = cache.insert_one(doc! { "type": "products_cache" }).await;

    let analysis = db.collection::<Document>(schema::ANALYSIS_RESULTS);
    let first_analysis = analysis.insert_one(doc! { "user_id": "user-1" }).await;
    let second_analysis = analysis.insert_one(doc! { "user_id": "user-1" }).await;
    let analysis_count = analysis.count_documents(doc! { "user_id": "user-1" }).await;

    deployment.cleanup().await.unwrap();

    assert!(first_request.is_ok());
    assert!(is_duplicate_key(&second_request.unwrap_err()));
    assert!(first_cache.is_ok());
    assert!(is_duplicate_key(&second_cache.unwrap_err()));
    assert!(first_analysis.is_ok());
    assert!(second_analysis.is_ok());
    assert_eq!(analysis_count.unwrap(), 2);
}

#[tokio::test]
async fn test_rerun_with_reconcile() {
    let deployment = TestDeployment::new(&suffix()).await;
    let first = provision(&deployment, ExistingPolicy::Reconcile).await;
    let second = Provisioner::new(
        &deployment.client,
        &deployment.schema,
        &deployment.admin,
        ExistingPolicy::Reconcile,
    )
    .run()
    .await;
    let report = verify(
        &deployment.client,
        &deployment.schema,
        &deployment.admin.username,
        &deployment.admin.auth_database,
    )
    .await;
    deployment.cleanup().await.unwrap();

    assert!(first.is_ok());
    let second = second.unwrap();
    assert_eq!(second.user, UserOutcome::Updated);
    assert!(second.collections_created.is_empty());
    assert_eq!(second.collections_existing.len(), 4);
    assert!(second.indexes_applied.is_empty());
    assert_eq!(second.indexes_existing.len(), 18);

    let report = report.unwrap();
    assert!(report.is_ok(), "{:?}", report.findings());
}

#[tokio::test]
async fn test_rerun_with_fail_stops_at_user() {
    let deployment = TestDeployment::new(&suffix()).await;
    let first = provision(&deployment, ExistingPolicy::Reconcile).await;

    // drop a collection so a later step would have work to do
    let db = deployment.client.database(&deployment.schema.database);
    db.collection::<Document>(schema::RECOMMENDATIONS)
        .drop()
        .await
        .unwrap();

    let second = provision(&deployment, ExistingPolicy::Fail).await;
    let collections = db.list_collection_names().await.unwrap();
    deployment.cleanup().await.unwrap();

    assert!(first.is_ok());
    match second {
        Err(ProvisionError::UserExists { username, .. }) => {
            assert_eq!(username, deployment.admin.username)
        }
        other => panic!("expected UserExists, got {:?}", other),
    }
    // aborted before the collection step
    assert!(!collections.contains(&schema::RECOMMENDATIONS.to_string()));
}

#[tokio::test]
async fn test_fail_policy_on_existing_collection() {
    let deployment = TestDeployment::new(&suffix()).await;
    let db = deployment.client.database(&deployment.schema.database);
    db.create_collection(schema::ANALYSIS_RESULTS).await.unwrap();

    let result = provision(&deployment, ExistingPolicy::Fail).await;
    let user_created = user_exists(
        &deployment.client,
        &deployment.admin.auth_database,
        &deployment.admin.username,
    )
    .await;
    let indexes = db
        .collection::<Document>(schema::REQUESTS)
        .list_index_names()
        .await;
    deployment.cleanup().await.unwrap();

    assert!(matches!(
        result,
        Err(ProvisionError::CollectionExists(ref name)) if name == schema::ANALYSIS_RESULTS
    ));
    // no rollback of the steps that already ran
    assert!(user_created.unwrap());
    // index step never ran, so requests has no secondary indexes
    assert!(indexes.map(|names| names.len() <= 1).unwrap_or(true));
}

#[tokio::test]
async fn test_conflicting_index_is_an_error() {
    let deployment = TestDeployment::new(&suffix()).await;
    let db = deployment.client.database(&deployment.schema.database);
    // same name as the declared unique index, but not unique
    db.collection::<Document>(schema::REQUESTS)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "request_id": 1 })
                .build(),
        )
        .await
        .unwrap();

    let result = provision(&deployment, ExistingPolicy::Reconcile).await;
    let cursor_names: Vec<String> = db
        .collection::<Document>(schema::REQUESTS)
        .list_indexes()
        .await
        .unwrap()
        .try_collect::<Vec<_>>()
        .await
        .unwrap()
        .into_iter()
        .filter_map(|index| index.options.and_then(|o| o.name))
        .collect();
    deployment.cleanup().await.unwrap();

    assert!(matches!(result, Err(ProvisionError::IndexConflict { .. })));
    assert!(cursor_names.contains(&"request_id_1".to_string()));
}

#[tokio::test]
async fn test_reconcile_accepts_renamed_index() {
    let deployment = TestDeployment::new(&suffix()).await;
    let db = deployment.client.database(&deployment.schema.database);
    db.collection::<Document>(schema::REQUESTS)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "request_id": 1 })
                .options(IndexOptions::builder().name("req_uniq".to_string()).unique(true).build())
                .build(),
        )
        .await
        .unwrap();

    let result = Provisioner::new(
        &deployment.client,
        &deployment.schema,
        &deployment.admin,
        ExistingPolicy::Reconcile,
    )
    .run()
    .await;
    let report = verify(
        &deployment.client,
        &deployment.schema,
        &deployment.admin.username,
        &deployment.admin.auth_database,
    )
    .await;
    let names = db
        .collection::<Document>(schema::REQUESTS)
        .list_index_names()
        .await;
    deployment.cleanup().await.unwrap();

    let summary = result.unwrap();
    assert_eq!(summary.indexes_existing, vec!["requests.req_uniq".to_string()]);
    assert_eq!(summary.indexes_applied.len(), 17);
    assert!(!summary.indexes_applied.contains(&"requests.request_id_1".to_string()));

    let report = report.unwrap();
    assert!(report.is_ok(), "{:?}", report.findings());

    let names = names.unwrap();
    assert!(names.contains(&"req_uniq".to_string()));
    assert!(!names.contains(&"request_id_1".to_string()));
}
