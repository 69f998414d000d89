#[macro_use]
extern crate rocket;

pub mod attachments;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod import;
pub mod ingest;
pub mod models;
pub mod routes;
pub mod store;
pub mod threading;

use crate::config::{ArchiverConfig, ArchivingApiConfig};
use crate::db::ArchiveDb;
use crate::ingest::Archiver;
use crate::store::PgBackend;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use rocket::{Build, Rocket};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

/// Raise the form limits so whole messages fit in the archiving request.
pub fn with_message_limits(figment: Figment) -> Figment {
    let limit = config::message_size_limit_mib() * 1024 * 1024;
    figment
        .merge(("limits.bytes", limit))
        .merge(("limits.data-form", limit + 1024 * 1024))
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    rocket::custom(with_message_limits(rocket::Config::figment()))
        .attach(ArchiveDb::init())
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite(
            "Run Migrations",
            |rocket| async move {
                match ArchiveDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        match db::run_migrations(&pool).await {
                            Ok(_) => {
                                log::info!("database migrations successful");
                                Ok(rocket)
                            }
                            Err(e) => {
                                log::error!("database migrations failed: {}", e);
                                Err(rocket)
                            }
                        }
                    }
                    None => {
                        log::error!("database pool not available for migrations");
                        Err(rocket)
                    }
                }
            },
        ))
        // Build the archiver on top of the pool; a missing archiver key is fatal
        .attach(AdHoc::try_on_ignite(
            "Archiver Configuration",
            |rocket| async move {
                let api_config = match ArchivingApiConfig::from_env() {
                    Ok(config) => config,
                    Err(e) => {
                        log::error!("invalid archiving api configuration: {}", e);
                        return Err(rocket);
                    }
                };
                let archiver_config = ArchiverConfig::from_env();

                match ArchiveDb::fetch(&rocket) {
                    Some(db) => {
                        let backend = Arc::new(PgBackend::new((**db).clone()));
                        let archiver = Archiver::new(backend, archiver_config);
                        log::info!(
                            "archiving api accepts requests from {}",
                            api_config.allowed_from.join(", ")
                        );
                        Ok(rocket.manage(archiver).manage(api_config))
                    }
                    None => Err(rocket),
                }
            },
        ))
        .mount(
            "/api",
            openapi_get_routes![
                routes::health::health_check,
                routes::mailman::archived_url,
                routes::mailman::archive_message,
            ],
        )
        .register(
            "/api/mailman",
            catchers![
                routes::mailman::unauthorized,
                routes::mailman::forbidden,
                routes::mailman::unprocessable,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../openapi.json".to_owned(),
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};

    use crate::config::ArchivingApiConfig;
    use crate::ingest::Archiver;

    pub use database::{TestDatabase, TestDatabaseError};

    pub mod database {
        //! Throwaway Postgres databases for store and migration tests.
        //!
        //! `TEST_DATABASE_URL` names a server the tests may create databases
        //! on. With `TEST_DATABASE_CONTAINER=1` a `postgres:16-alpine`
        //! container is started instead. Without either, provisioning fails
        //! with [`TestDatabaseError::MissingUrl`] and the caller skips.

        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers::{GenericImage, ImageExt, core::WaitFor};
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        use crate::config::env_bool;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("TEST_DATABASE_URL not set")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// A migrated database that exists for one test.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            server: PgConnectOptions,
            name: String,
            _container: Option<ContainerAsync<GenericImage>>,
        }

        impl TestDatabase {
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
                    return Self::create_on(&url, None).await;
                }
                if env_bool("TEST_DATABASE_CONTAINER", false) {
                    return Self::new().await;
                }
                Err(TestDatabaseError::MissingUrl)
            }

            /// Start a disposable server and create the database on it.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = GenericImage::new("postgres", "16-alpine")
                    .with_wait_for(WaitFor::message_on_stderr(
                        "database system is ready to accept connections",
                    ))
                    .with_env_var("POSTGRES_USER", "archiver")
                    .with_env_var("POSTGRES_PASSWORD", "archiver")
                    .start()
                    .await?;

                let url = format!(
                    "postgres://archiver:archiver@{}:{}/postgres",
                    container.get_host().await?,
                    container.get_host_port_ipv4(5432).await?
                );
                Self::create_on(&url, Some(container)).await
            }

            async fn create_on(
                url: &str,
                container: Option<ContainerAsync<GenericImage>>,
            ) -> Result<Self, TestDatabaseError> {
                let server: PgConnectOptions = url.parse()?;
                let server = server.log_statements(LevelFilter::Off).database("postgres");
                let name = format!("archive_test_{}", Uuid::new_v4().simple());
                run_on_server(&server, &format!("CREATE DATABASE \"{}\"", name)).await?;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(server.clone().database(&name))
                    .await?;
                crate::db::run_migrations(&pool).await?;
                log::debug!("created test database {}", name);

                Ok(Self {
                    pool: Some(pool),
                    server,
                    name,
                    _container: container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is open")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close the pool and drop the database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }
                run_on_server(&self.server, &drop_statement(&self.name)).await?;
                Ok(())
            }
        }

        fn drop_statement(name: &str) -> String {
            format!("DROP DATABASE IF EXISTS \"{}\"", name)
        }

        async fn run_on_server(server: &PgConnectOptions, statement: &str) -> Result<(), sqlx::Error> {
            let admin = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(server.clone())
                .await?;
            sqlx::query(statement).execute(&admin).await?;
            admin.close().await;
            Ok(())
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                let Some(pool) = self.pool.take() else {
                    return;
                };
                let server = self.server.clone();
                let statement = drop_statement(&self.name);
                match Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            pool.close().await;
                            if let Err(err) = run_on_server(&server, &statement).await {
                                log::warn!("failed to drop test database: {}", err);
                            }
                        });
                    }
                    Err(_) => log::warn!("test database {} left behind", self.name),
                }
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        archiver: Option<Archiver>,
        api_config: Option<ArchivingApiConfig>,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment: crate::with_message_limits(figment),
                mounts: Vec::new(),
                archiver: None,
                api_config: None,
            }
        }

        /// Mount routes under `/api`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api".to_string(), routes));
            self
        }

        pub fn manage_archiver(mut self, archiver: Archiver) -> Self {
            self.archiver = Some(archiver);
            self
        }

        pub fn manage_api_config(mut self, config: ArchivingApiConfig) -> Self {
            self.api_config = Some(config);
            self
        }

        /// Finish building the Rocket instance.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment).register(
                "/api/mailman",
                catchers![
                    crate::routes::mailman::unauthorized,
                    crate::routes::mailman::forbidden,
                    crate::routes::mailman::unprocessable,
                ],
            );

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            if let Some(archiver) = self.archiver {
                rocket = rocket.manage(archiver);
            }
            if let Some(config) = self.api_config {
                rocket = rocket.manage(config);
            }

            rocket
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
