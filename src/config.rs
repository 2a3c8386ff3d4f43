use crate::{
    persistor::{
        BackendKind, DEFAULT_CLIENT_CACHE_CAPACITY, FallbackSettings, PersistorSettings,
        gcs::GcsSettings, local::LocalSettings, s3::S3Settings,
    },
    services::{file_converter::Renderer, storage_service::ServiceSettings},
};
use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use serde::de::DeserializeOwned;
use std::{collections::HashMap, env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub upload_folder: PathBuf,
    pub persistor: PersistorSettings,
    pub service: ServiceSettings,
    pub conversions: ConversionSettings,
}

#[derive(Debug, Clone)]
pub struct ConversionSettings {
    pub enabled: bool,
    pub renderer: Renderer,
    /// Prepended to converter and optimiser command lines (e.g. `nice -n 10`).
    pub command_prefix: Vec<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Project file storage service")]
pub struct Args {
    /// Host to bind to (overrides FILESTORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILESTORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage backend: fs, s3 or gcs (overrides FILESTORE_BACKEND)
    #[arg(long)]
    pub backend: Option<String>,

    /// Directory for staging files (overrides FILESTORE_UPLOAD_FOLDER)
    #[arg(long)]
    pub upload_folder: Option<PathBuf>,
}

impl AppConfig {
    /// Parse CLI args and the process environment into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();
        Self::from_lookup(args, |name| env::var(name).ok())
    }

    /// Build the configuration from `args` and a variable lookup.
    pub fn from_lookup(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(&lookup);

        let backend_name = args
            .backend
            .or_else(|| vars.get("FILESTORE_BACKEND"))
            .unwrap_or_else(|| "fs".into());
        let backend = BackendKind::from_str(&backend_name)
            .with_context(|| format!("parsing backend `{backend_name}`"))?;

        let persistor = PersistorSettings {
            backend,
            local: LocalSettings {
                use_subdirectories: vars.flag("FILESTORE_USE_SUBDIRECTORIES")?,
            },
            s3: s3_settings(&vars)?,
            gcs: gcs_settings(&vars)?,
            fallback: fallback_settings(&vars)?,
            client_cache_capacity: vars
                .parse("FILESTORE_CLIENT_CACHE_CAPACITY")?
                .unwrap_or(DEFAULT_CLIENT_CACHE_CAPACITY),
        };

        let health_check_file = match (
            vars.get("HEALTH_CHECK_PROJECT_ID"),
            vars.get("HEALTH_CHECK_FILE_ID"),
        ) {
            (Some(project_id), Some(file_id)) => Some((project_id, file_id)),
            (None, None) => None,
            _ => bail!("HEALTH_CHECK_PROJECT_ID and HEALTH_CHECK_FILE_ID must be set together"),
        };
        let service = ServiceSettings {
            user_files_bucket: vars
                .get("FILESTORE_USER_FILES_BUCKET")
                .unwrap_or_else(|| "./data/user_files".into()),
            template_files_bucket: vars
                .get("FILESTORE_TEMPLATE_FILES_BUCKET")
                .unwrap_or_else(|| "./data/template_files".into()),
            allow_redirects: vars.flag("FILESTORE_ALLOW_REDIRECTS")?,
            health_check_file,
        };

        let conversions = ConversionSettings {
            enabled: vars.flag("ENABLE_CONVERSIONS")?,
            renderer: match vars.get("CONVERSION_RENDERER") {
                Some(name) => name.parse().map_err(|err: String| anyhow!(err))?,
                None => Renderer::ImageMagick,
            },
            command_prefix: vars
                .get("CONVERSION_COMMAND_PREFIX")
                .map(|prefix| prefix.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        };

        Ok(Self {
            host: args
                .host
                .or_else(|| vars.get("FILESTORE_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: match args.port {
                Some(port) => port,
                None => vars.parse("FILESTORE_PORT")?.unwrap_or(3009),
            },
            upload_folder: args
                .upload_folder
                .or_else(|| vars.get("FILESTORE_UPLOAD_FOLDER").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("./data/uploads")),
            persistor,
            service,
            conversions,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn s3_settings(vars: &Vars<'_>) -> Result<S3Settings> {
    let defaults = S3Settings::default();
    Ok(S3Settings {
        key: vars.get("AWS_ACCESS_KEY_ID"),
        secret: vars.get("AWS_SECRET_ACCESS_KEY"),
        endpoint: vars.get("AWS_S3_ENDPOINT"),
        region: vars.get("AWS_REGION"),
        bucket_credentials: vars.json("S3_BUCKET_CREDENTIALS")?.unwrap_or_default(),
        part_size: vars.parse("S3_PART_SIZE")?.unwrap_or(defaults.part_size),
        signed_url_expiry: vars
            .parse("SIGNED_URL_EXPIRY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.signed_url_expiry),
    })
}

fn gcs_settings(vars: &Vars<'_>) -> Result<GcsSettings> {
    let defaults = GcsSettings::default();
    Ok(GcsSettings {
        service_account_path: vars.get("GCS_SERVICE_ACCOUNT_PATH"),
        deleted_bucket_suffix: vars.get("GCS_DELETED_BUCKET_SUFFIX"),
        unsigned_urls: vars.flag("GCS_UNSIGNED_URLS")?,
        endpoint: vars.get("GCS_API_ENDPOINT"),
        signed_url_expiry: vars
            .parse("SIGNED_URL_EXPIRY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.signed_url_expiry),
    })
}

fn fallback_settings(vars: &Vars<'_>) -> Result<Option<FallbackSettings>> {
    let Some(name) = vars.get("FALLBACK_BACKEND") else {
        return Ok(None);
    };
    let backend = BackendKind::from_str(&name)
        .with_context(|| format!("parsing FALLBACK_BACKEND value `{name}`"))?;
    let buckets: HashMap<String, String> =
        vars.json("FALLBACK_BUCKET_MAPPING")?.unwrap_or_default();
    Ok(Some(FallbackSettings {
        backend,
        buckets,
        copy_on_miss: vars.flag("COPY_ON_MISS")?,
    }))
}

/// Typed access to configuration variables; empty values count as unset.
struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(name)
            .map(|value| {
                value
                    .trim()
                    .parse::<T>()
                    .map_err(|err| anyhow!("parsing {name} value `{value}`: {err}"))
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> Result<bool> {
        match self.get(name).map(|value| value.trim().to_ascii_lowercase()) {
            None => Ok(false),
            Some(value) => match value.as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => bail!("parsing {name} value `{value}` as a boolean"),
            },
        }
    }

    fn json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.get(name)
            .map(|value| {
                serde_json::from_str(&value).with_context(|| format!("parsing {name} as JSON"))
            })
            .transpose()
    }
}
