use futures::TryStreamExt;
use mongodb::{
    Client, Collection, IndexModel,
    bson::{Document, doc},
    error::{ErrorKind, WriteFailure},
    options::{ClientOptions, Credential, IndexOptions},
};
use tracing::{debug, info, instrument};

use crate::{
    conf::{ConfError, DatabaseConfig, MONGODB_URI_ENV, RetryConfig},
    utils::{
        enums::Direction,
        o11y::{WARN, log_error},
    },
};

/// Server error codes the provisioner cares about.
pub mod codes {
    pub const NAMESPACE_EXISTS: i32 = 48;
    pub const INDEX_OPTIONS_CONFLICT: i32 = 85;
    pub const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
    pub const DUPLICATE_KEY: i32 = 11000;
    pub const USER_ALREADY_EXISTS: i32 = 51003;
}

#[derive(thiserror::Error, Debug)]
#[error("failed to create index")]
pub struct CreateIndexError(#[from] mongodb::error::Error);

impl CreateIndexError {
    pub fn code(&self) -> Option<i32> {
        error_code(&self.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("error from config")]
    Conf(#[from] ConfError),
    #[error("error from mongodb")]
    Mongodb(#[from] mongodb::error::Error),
    #[error("could not reach the server after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        source: mongodb::error::Error,
    },
}

#[instrument(skip(collection, index), err, fields(collection = collection.name()))]
pub async fn create_index(
    collection: &Collection<Document>,
    index: Document,
    unique: bool,
) -> Result<(), CreateIndexError> {
    let index_model = IndexModel::builder()
        .keys(index)
        .options(IndexOptions::builder().unique(unique).build())
        .build();
    collection.create_index(index_model).await?;
    Ok(())
}

pub async fn list_indexes(
    collection: &Collection<Document>,
) -> Result<Vec<IndexModel>, mongodb::error::Error> {
    collection.list_indexes().await?.try_collect().await
}

/// Field and direction of each key, `None` for text, hashed or geo indexes.
pub fn key_pattern(model: &IndexModel) -> Option<Vec<(String, Direction)>> {
    model
        .keys
        .iter()
        .map(|(field, value)| Direction::from_bson(value).map(|d| (field.clone(), d)))
        .collect()
}

pub fn is_unique(model: &IndexModel) -> bool {
    model
        .options
        .as_ref()
        .and_then(|options| options.unique)
        .unwrap_or(false)
}

/// Options set on an index that change what it holds or how long documents
/// stay in it. The declared indexes set none of these.
pub fn extra_options(model: &IndexModel) -> Vec<&'static str> {
    let Some(options) = model.options.as_ref() else {
        return Vec::new();
    };
    let mut extra = Vec::new();
    if options.sparse == Some(true) {
        extra.push("sparse");
    }
    if options.partial_filter_expression.is_some() {
        extra.push("partialFilterExpression");
    }
    if options.expire_after.is_some() {
        extra.push("expireAfterSeconds");
    }
    if options.collation.is_some() {
        extra.push("collation");
    }
    if options.hidden == Some(true) {
        extra.push("hidden");
    }
    extra
}

/// The server error code carried by a command or write error, if any.
pub fn error_code(error: &mongodb::error::Error) -> Option<i32> {
    match *error.kind {
        ErrorKind::Command(ref command_error) => Some(command_error.code),
        ErrorKind::Write(WriteFailure::WriteError(ref write_error)) => Some(write_error.code),
        _ => None,
    }
}

pub fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    error_code(error) == Some(codes::DUPLICATE_KEY)
}

/// Build a client from the `database` config section. `MONGODB_URI`, when
/// set, is used as is and its own credentials win.
pub async fn build_client(db_conf: &DatabaseConfig) -> Result<Client, ConnectError> {
    let from_env = std::env::var(MONGODB_URI_ENV).ok();
    let uri = from_env.clone().unwrap_or_else(|| db_conf.base_uri());

    let mut options = ClientOptions::parse(uri.as_str()).await?;
    options.app_name = Some("eyeglass-provision".to_string());
    options.server_selection_timeout = Some(db_conf.server_selection_timeout);
    options.connect_timeout = Some(db_conf.connect_timeout);

    if from_env.is_none() {
        if let Some(username) = &db_conf.username {
            let password = db_conf
                .password
                .as_ref()
                .map(|source| source.resolve())
                .transpose()?;
            options.credential = Some(
                Credential::builder()
                    .username(username.clone())
                    .password(password.map(|secret| secret.expose().to_string()))
                    .source(db_conf.auth_database.clone())
                    .build(),
            );
        }
    } else {
        debug!("using connection string from {}", MONGODB_URI_ENV);
    }

    Ok(Client::with_options(options)?)
}

async fn ping(client: &Client) -> Result<(), mongodb::error::Error> {
    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await?;
    Ok(())
}

async fn try_connect(db_conf: &DatabaseConfig) -> Result<Client, ConnectError> {
    let client = build_client(db_conf).await?;
    ping(&client).await?;
    Ok(client)
}

/// Connect and ping the server, retrying with exponential backoff.
///
/// The client is rebuilt on every attempt: parsing a `mongodb+srv://` URI
/// resolves DNS records, and the driver connects lazily, so only the ping
/// proves the server is reachable. Config errors are not retried.
#[instrument(skip_all, err)]
pub async fn connect(db_conf: &DatabaseConfig, retry: &RetryConfig) -> Result<Client, ConnectError> {
    let mut delays = retry.delays();
    let mut attempt = 1;
    loop {
        let error = match try_connect(db_conf).await {
            Ok(client) => {
                info!(attempt, "connected to the database server");
                return Ok(client);
            }
            Err(ConnectError::Mongodb(error)) => error,
            Err(error) => return Err(error),
        };
        match delays.next() {
            Some(delay) => {
                log_error!(
                    WARN,
                    error,
                    "connection attempt {} of {} failed, retrying in {:?}",
                    attempt,
                    retry.max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                return Err(ConnectError::Exhausted {
                    attempts: attempt,
                    source: error,
                });
            }
        }
    }
}
