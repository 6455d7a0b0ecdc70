use serde::de::DeserializeOwned;

use crate::environment::Environment;

/// Directory holding the configuration files, relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Configuration file loaded for every environment.
const BASE_CONFIG_FILE: &str = "base.yaml";

/// Prefix of environment variable overrides.
const ENV_PREFIX: &str = "APP";

/// Separator between the prefix and the first key segment.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested keys, `APP_SNAPSHOT__CHUNK_SIZE` sets `snapshot.chunk_size`.
const ENV_SEPARATOR: &str = "__";

/// Separator for list values, `APP_SNAPSHOT__TABLES=public.a,public.b`.
const LIST_SEPARATOR: &str = ",";

/// Configuration types loadable through [`load_config`].
pub trait Config {
    /// Keys whose environment variable overrides are split into lists.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// Loads configuration in this order, later sources overriding earlier ones:
/// 1. `configuration/base.yaml`
/// 2. `configuration/{environment}.yaml`
/// 3. `APP_`-prefixed environment variables
pub fn load_config<T>() -> Result<T, config::ConfigError>
where
    T: Config + DeserializeOwned,
{
    let base_path = std::env::current_dir().map_err(|err| {
        config::ConfigError::Message(format!("failed to determine the current directory: {err}"))
    })?;
    let configuration_directory = base_path.join(CONFIGURATION_DIR);

    let environment = Environment::load().map_err(|err| {
        config::ConfigError::Message(format!("failed to parse APP_ENVIRONMENT: {err}"))
    })?;
    let environment_filename = format!("{environment}.yaml");

    let mut environment_source = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    if !<T as Config>::LIST_PARSE_KEYS.is_empty() {
        environment_source = environment_source
            .try_parsing(true)
            .list_separator(LIST_SEPARATOR);

        for key in <T as Config>::LIST_PARSE_KEYS {
            environment_source = environment_source.with_list_parse_key(key);
        }
    }

    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join(BASE_CONFIG_FILE),
        ))
        // The environment file is optional so a single base file is enough for local runs.
        .add_source(
            config::File::from(configuration_directory.join(environment_filename)).required(false),
        )
        .add_source(environment_source)
        .build()?;

    settings.try_deserialize::<T>()
}
