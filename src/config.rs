use std::str::FromStr;

/// The port used when a configuration does not name one.
pub const DEFAULT_PORT: u16 = 587;

/// Environment variable holding a complete configuration string.
pub const ENV_URL: &str = "SMTP_URL";
pub const ENV_HOST: &str = "SMTP_HOST";
pub const ENV_PORT: &str = "SMTP_PORT";
pub const ENV_USER: &str = "SMTP_USER";
pub const ENV_PASSWORD: &str = "SMTP_PASSWORD";

/// The configuration of an SMTP endpoint.
///
/// This type can be parsed from a string of the form
/// `[username:password@]address[:port]`.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Config<T> {
    pub address: T,
    pub port: Option<u16>,
    pub credentials: Option<(String, String)>,
}

/// An error while loading a configuration from the environment.
#[derive(thiserror::Error, PartialEq, Eq, Debug)]
pub enum ConfigError {
    #[error("missing environment variable `{0}`")]
    Missing(&'static str),
    #[error("invalid environment variable `{variable}`: {reason}")]
    Invalid {
        variable: &'static str,
        reason: &'static str,
    },
}

impl<T> Config<T> {
    /// The configured port, or [`DEFAULT_PORT`].
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl<T: FromStr> Config<T> {
    /// Load the configuration from the process environment.
    ///
    /// See [`Config::from_vars`] for the variables read.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load the configuration using `lookup` to read variables.
    ///
    /// If `SMTP_URL` is set it is parsed like [`Config::from_str`].
    /// Otherwise `SMTP_HOST` is required and `SMTP_PORT`,
    /// `SMTP_USER` and `SMTP_PASSWORD` are optional.
    /// Credentials are only used when both user and password are set.
    pub fn from_vars(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(url) = lookup(ENV_URL) {
            return url.parse().map_err(|reason| ConfigError::Invalid {
                variable: ENV_URL,
                reason,
            });
        }
        let host = lookup(ENV_HOST).ok_or(ConfigError::Missing(ENV_HOST))?;
        let address =
            T::from_str(&host).map_err(|_| ConfigError::Invalid {
                variable: ENV_HOST,
                reason: "invalid address",
            })?;
        let port = lookup(ENV_PORT)
            .map(|port| {
                port.parse().map_err(|_| ConfigError::Invalid {
                    variable: ENV_PORT,
                    reason: "invalid port number",
                })
            })
            .transpose()?;
        let credentials = match (lookup(ENV_USER), lookup(ENV_PASSWORD)) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        };
        Ok(Config {
            address,
            port,
            credentials,
        })
    }
}

impl<T: FromStr> FromStr for Config<T> {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // the password may contain '@', the host may not
        let (credentials, host) =
            if let Some((user, host)) = s.rsplit_once('@') {
                if let Some((username, password)) = user.split_once(':') {
                    let credentials =
                        (username.to_string(), password.to_string());
                    (Some(credentials), host)
                } else {
                    return Err("missing ':' in user");
                }
            } else {
                (None, s)
            };
        if let Some((address, port)) = host.rsplit_once(':') {
            Ok(Config {
                address: T::from_str(address).map_err(|_| "invalid address")?,
                port: Some(port.parse().map_err(|_| "invalid port number")?),
                credentials,
            })
        } else {
            Ok(Config {
                address: T::from_str(host).map_err(|_| "invalid address")?,
                port: None,
                credentials,
            })
        }
    }
}
