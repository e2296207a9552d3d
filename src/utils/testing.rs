// Utilities for the integration tests, which expect a MongoDB server
// configured as in tests/config.test.yaml.
use mongodb::{Client, bson::doc};

use crate::{
    conf::{AppConfig, PasswordSource, Secret},
    schema::{AdminPrincipal, Schema},
    utils::{
        db::connect,
        o11y::{WARN, as_error},
    },
};

pub const TEST_CONFIG_FILE: &str = "tests/config.test.yaml";
pub const TEST_ADMIN_PASSWORD: &str = "eyeglass-test-password";

pub fn test_config() -> AppConfig {
    AppConfig::from_path(TEST_CONFIG_FILE).unwrap()
}

/// A uniquely named target database and admin user, so tests can run in
/// parallel against one server.
pub struct TestDeployment {
    pub client: Client,
    pub config: AppConfig,
    pub schema: Schema,
    pub admin: AdminPrincipal,
}

impl TestDeployment {
    pub async fn new(suffix: &str) -> Self {
        let mut config = test_config();
        config.database.name = format!("eyeglass_test_{}", suffix);
        config.admin.username = format!("eyeglass_admin_{}", suffix);
        config.admin.password = PasswordSource::Literal(Secret::new(TEST_ADMIN_PASSWORD));

        let client = connect(&config.database, &config.retry).await.unwrap();
        let schema = Schema::for_database(&config.database.name);
        let admin = AdminPrincipal::from_config(&config, &schema).unwrap();
        TestDeployment {
            client,
            config,
            schema,
            admin,
        }
    }

    pub async fn cleanup(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.client.database(&self.schema.database).drop().await?;
        // the user may not exist if the test failed early
        let _ = self
            .client
            .database(&self.admin.auth_database)
            .run_command(doc! { "dropUser": self.admin.username.as_str() })
            .await
            .inspect_err(as_error!(WARN, "failed to drop test user"));
        Ok(())
    }
}
