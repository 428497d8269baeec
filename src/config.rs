//! Startup configuration: the solver type file and command-line arguments.
//!
//! The type file is line oriented, one `class_name solution_name` pair per
//! line. Underscores in the class name stand for spaces. Lines that cannot
//! be parsed are logged and skipped; a file that yields no pairs at all is
//! a fatal configuration error.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::ConfigError;
use crate::model::TypeRegistration;
use crate::pattern::has_class_segment;

/// Class → solution mapping loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeConfig {
    classes: BTreeMap<String, String>,
    registrations: Vec<TypeRegistration>,
}

impl TypeConfig {
    /// Loads the type file at `path`.
    ///
    /// # Errors
    ///
    /// `ConfigError::Unreadable` if the file cannot be opened or read,
    /// `ConfigError::NoTypes` if no line yields a pair.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(BufReader::new(file)).map_err(|err| match err {
            ConfigError::Unreadable { source, .. } => ConfigError::Unreadable {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses type lines from any reader.
    ///
    /// # Errors
    ///
    /// See [`TypeConfig::load`].
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, ConfigError> {
        let mut classes = BTreeMap::new();
        let mut registrations: Vec<TypeRegistration> = Vec::new();

        for line in reader.lines() {
            let line = line.map_err(|source| ConfigError::Unreadable {
                path: PathBuf::new(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let Some((class, solution)) = parse_line(&line) else {
                warn!(line = %line, "Couldn't make sense of config line; skipping");
                continue;
            };

            info!(class = %class, solution = %solution, "Registered class solution");
            if !registrations.iter().any(|r| r.solution_name == solution) {
                registrations.push(TypeRegistration::persistent(solution.clone()));
            }
            classes.insert(class, solution);
        }

        if classes.is_empty() {
            return Err(ConfigError::NoTypes);
        }

        Ok(Self {
            classes,
            registrations,
        })
    }

    /// Class name → solution name, sorted by class.
    #[must_use]
    pub fn classes(&self) -> &BTreeMap<String, String> {
        &self.classes
    }

    /// Class names, sorted.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    /// Solution types the solver announces to the world model.
    #[must_use]
    pub fn registrations(&self) -> &[TypeRegistration] {
        &self.registrations
    }

    /// Every `(class, solution)` whose class appears as a segment of `uri`.
    pub fn solutions_for<'a>(&'a self, uri: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.classes
            .iter()
            .filter(move |(class, _)| has_class_segment(uri, class))
            .map(|(class, solution)| (class.as_str(), solution.as_str()))
    }
}

/// Parses one `class_name solution_name` line.
///
/// Extra trailing tokens are ignored. Underscores in the class name become
/// spaces.
#[must_use]
pub fn parse_line(line: &str) -> Option<(String, String)> {
    let mut tokens = line.split_whitespace();
    let class = tokens.next()?;
    let solution = tokens.next()?;
    Some((class.replace('_', " "), solution.to_string()))
}

/// Command-line arguments of the solver binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// World model host.
    pub host: String,
    /// Client port of the world model.
    pub client_port: u16,
    /// Solver port of the world model (defaults to the client port).
    pub solver_port: u16,
    /// Path to the type file.
    pub config_path: PathBuf,
}

/// Usage line for the solver binary.
pub const USAGE: &str =
    "binary-state-solver <world model host> <client port> [--solver-port <port>] <config file>";

impl CliArgs {
    /// Parses arguments, excluding the program name.
    ///
    /// # Errors
    ///
    /// `ConfigError::Usage` on a wrong argument count or unknown flag,
    /// `ConfigError::InvalidArgument` on a malformed port.
    pub fn parse<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut positional = Vec::new();
        let mut solver_port = None;

        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--solver-port" | "-s" => {
                    let value = iter.next().ok_or_else(|| ConfigError::Usage {
                        usage: USAGE.to_string(),
                    })?;
                    solver_port = Some(parse_port("solver port", &value)?);
                }
                "--help" | "-h" => {
                    return Err(ConfigError::Usage {
                        usage: USAGE.to_string(),
                    })
                }
                flag if flag.starts_with("--") => {
                    return Err(ConfigError::Usage {
                        usage: USAGE.to_string(),
                    })
                }
                _ => positional.push(arg),
            }
        }

        let [host, client_port, config_path]: [String; 3] =
            positional.try_into().map_err(|_| ConfigError::Usage {
                usage: USAGE.to_string(),
            })?;

        let client_port = parse_port("client port", &client_port)?;
        Ok(Self {
            host,
            client_port,
            solver_port: solver_port.unwrap_or(client_port),
            config_path: PathBuf::from(config_path),
        })
    }

    /// `host:port` for the client connection.
    #[must_use]
    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    /// `host:port` for the solver connection.
    #[must_use]
    pub fn solver_addr(&self) -> String {
        format!("{}:{}", self.host, self.solver_port)
    }
}

fn parse_port(name: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidArgument {
        name: name.to_string(),
        reason: format!("'{value}' is not a valid port number"),
    })
}
