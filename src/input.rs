//! Provides a means to read, parse and hold configuration options for campaigns.
use clap::{Parser, ValueEnum};
use itertools::Itertools;
use serde_derive::Deserialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::campaign::TargetCount;

const LOWEST_PORT_NUMBER: u16 = 1;
const TOP_PORT_NUMBER: u16 = 65535;

/// Ports the CDN edge answers on, primary port first.
pub const DEFAULT_PORTS: [u16; 7] = [443, 80, 8443, 2053, 2083, 2087, 2096];

/// How hard a campaign leans on the local machine.
///   - the resource fraction scales the worker pool,
///   - the block density is how many hosts are drawn from every /24.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpeedProfile {
    Hyper,
    Turbo,
    Ultra,
    Deep,
}

impl SpeedProfile {
    pub const fn resource_fraction(self) -> f64 {
        match self {
            Self::Hyper => 0.20,
            Self::Turbo => 0.40,
            Self::Ultra => 0.60,
            Self::Deep => 0.80,
        }
    }

    pub const fn addresses_per_block(self) -> usize {
        match self {
            Self::Hyper => 30,
            Self::Turbo => 50,
            Self::Ultra => 80,
            Self::Deep => 120,
        }
    }
}

impl fmt::Display for SpeedProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hyper => "Hyper",
            Self::Turbo => "Turbo",
            Self::Ultra => "Ultra",
            Self::Deep => "Deep",
        };
        write!(f, "{name} ({:.0}%)", self.resource_fraction() * 100.0)
    }
}

pub type Ports = Vec<u16>;

/// Parses `443,80,2050-2053` keeping the order given; the first port is the
/// one every address is verified on.
#[cfg(not(tarpaulin_include))]
pub fn parse_ports_and_ranges(input: &str) -> Result<Ports, String> {
    let mut ports = Vec::new();

    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if part.contains('-') {
            let range_ports = parse_port_range(part)?;
            ports.extend(range_ports);
        } else {
            let port = parse_single_port(part)?;
            ports.push(port);
        }
    }

    if ports.is_empty() {
        return Err(String::from("No valid ports or ranges provided"));
    }

    Ok(ports.into_iter().unique().collect())
}

fn parse_port_range(range_str: &str) -> Result<Vec<u16>, String> {
    let Some((start, end)) = range_str.split_once('-').filter(|(_, end)| !end.contains('-'))
    else {
        return Err(format!(
            "Invalid range format '{range_str}'. Expected 'start-end'. Example: 2050-2053.",
        ));
    };

    let start: u16 = start
        .trim()
        .parse()
        .map_err(|_| format!("Invalid start port '{start}' in range '{range_str}'"))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|_| format!("Invalid end port '{end}' in range '{range_str}'"))?;

    if start > end {
        return Err(format!(
            "Start port {start} is greater than end port {end} in range '{range_str}'",
        ));
    }

    if start < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Ports in range '{range_str}' must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok((start..=end).collect())
}

fn parse_single_port(port_str: &str) -> Result<u16, String> {
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("Invalid port number '{port_str}'"))?;

    if port < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Port {port} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok(port)
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cdnscan",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// Finds fast, reachable CDN edge addresses.
/// Samples the given ranges, verifies each candidate against the edge trace
/// endpoint and ranks what answers.
pub struct Opts {
    /// A comma-delimited list of CIDR blocks or single addresses to sample from.
    #[arg(short = 'a', long, alias = "addresses", value_delimiter = ',')]
    pub ranges: Vec<String>,

    /// A newline-delimited file of ranges. Lines starting with '#' are ignored.
    #[arg(short = 'f', long, value_parser)]
    pub ranges_file: Option<PathBuf>,

    /// Ports to probe, the first one is verified, the others swept.
    /// Examples: 443,80,8443 or 2050-2053
    #[arg(short, long, value_parser = parse_ports_and_ranges)]
    pub ports: Option<Ports>,

    /// Speed profile: share of local resources and hosts drawn per /24.
    #[arg(short, long, value_enum, ignore_case = true, default_value = "hyper")]
    pub speed: SpeedProfile,

    /// How many valid addresses to find, or 'all' for one large sweep.
    #[arg(short, long, default_value = "100")]
    pub target: TargetCount,

    /// Discard results faster than this, in milliseconds.
    #[arg(long, default_value = "0")]
    pub ping_min: u32,

    /// Discard results slower than this, in milliseconds. Also the latency
    /// ceiling used while verifying.
    #[arg(long, default_value = "9999")]
    pub ping_max: u32,

    /// A vless://, vmess:// or trojan:// link. Addresses are checked with a
    /// handshake using its transport settings and reported as rewritten links.
    #[arg(long)]
    pub tunnel: Option<String>,

    /// Size of the worker pool. Inferred from the speed profile by default.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Keep the sampled order instead of shuffling each batch.
    #[arg(long)]
    pub no_shuffle: bool,

    /// File remembering addresses that failed, shared across campaigns.
    #[arg(long, value_parser)]
    pub failure_cache: Option<PathBuf>,

    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Hide the banner
    #[arg(long)]
    pub no_banner: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,

    /// Greppable mode. Only output the addresses, one per line.
    #[arg(short, long)]
    pub greppable: bool,

    /// Accessible mode. Turns off features which negatively affect screen readers.
    #[arg(long)]
    pub accessible: bool,

    /// Print every event as a JSON line.
    #[arg(long, conflicts_with = "greppable")]
    pub json: bool,

    /// Automatically ups the ULIMIT with the value you provided.
    #[arg(short, long)]
    pub ulimit: Option<u64>,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    pub fn read() -> Self {
        Self::parse()
    }

    /// Reads the command line arguments into an Opts struct and merge
    /// values found within the user configuration file.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            ranges, speed, target, ping_min, ping_max, no_shuffle, greppable, accessible, json
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        // Ports given on the command line win over the config file.
        if self.ports.is_none() {
            self.ports = config.ports.clone();
        }

        merge_optional!(ranges_file, tunnel, workers, failure_cache, ulimit);
    }

    /// The ports to probe, falling back to [`DEFAULT_PORTS`].
    pub fn ports(&self) -> Ports {
        self.ports
            .clone()
            .unwrap_or_else(|| DEFAULT_PORTS.to_vec())
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            ranges: vec![],
            ranges_file: None,
            ports: None,
            speed: SpeedProfile::Hyper,
            target: TargetCount::Bounded(100),
            ping_min: 0,
            ping_max: 9999,
            tunnel: None,
            workers: None,
            no_shuffle: false,
            failure_cache: None,
            no_config: true,
            no_banner: false,
            config_path: None,
            greppable: true,
            accessible: false,
            json: false,
            ulimit: None,
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[cfg(not(tarpaulin_include))]
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    ranges: Option<Vec<String>>,
    ranges_file: Option<PathBuf>,
    ports: Option<Vec<u16>>,
    speed: Option<SpeedProfile>,
    target: Option<TargetCount>,
    ping_min: Option<u32>,
    ping_max: Option<u32>,
    tunnel: Option<String>,
    workers: Option<usize>,
    no_shuffle: Option<bool>,
    failure_cache: Option<PathBuf>,
    greppable: Option<bool>,
    accessible: Option<bool>,
    json: Option<bool>,
    ulimit: Option<u64>,
}

#[cfg(not(tarpaulin_include))]
impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct. A missing or unreadable file is an empty config.
    ///
    /// # Format
    ///
    /// ranges = ["104.16.0.0/13", "172.64.0.0/13"]
    /// ports = [443, 80, 8443]
    /// speed = "turbo"
    /// target = 50
    /// ping_max = 800
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> Result<Self, toml::de::Error> {
        let Some(config_path) = custom_config_path.or_else(default_config_path) else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(config_path).unwrap_or_default();
        toml::from_str(&content)
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> Option<PathBuf> {
    let mut config_path = dirs::home_dir()?;
    config_path.push(".cdnscan.toml");
    Some(config_path)
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use parameterized::parameterized;

    use super::{parse_ports_and_ranges, Config, Opts, SpeedProfile, DEFAULT_PORTS};
    use crate::campaign::TargetCount;

    impl Config {
        fn sample() -> Self {
            Self {
                ranges: Some(vec!["104.16.0.0/13".to_owned()]),
                ports: Some(vec![2053, 443]),
                speed: Some(SpeedProfile::Deep),
                target: Some(TargetCount::Bounded(25)),
                ping_max: Some(800),
                greppable: Some(true),
                accessible: Some(true),
                workers: Some(64),
                ..Self::default()
            }
        }
    }

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[parameterized(input = {
        vec!["cdnscan", "--ranges", "104.16.0.0/13"],
        vec!["cdnscan", "--addresses", "104.16.0.0/13,1.1.1.1", "--target", "all"],
        vec!["cdnscan", "-a", "104.16.0.0/13", "-s", "ULTRA", "-t", "7"],
    }, expected = {
        (vec!["104.16.0.0/13"], SpeedProfile::Hyper, TargetCount::Bounded(100)),
        (vec!["104.16.0.0/13", "1.1.1.1"], SpeedProfile::Hyper, TargetCount::Unbounded),
        (vec!["104.16.0.0/13"], SpeedProfile::Ultra, TargetCount::Bounded(7)),
    })]
    fn parse_campaign_arguments(input: Vec<&str>, expected: (Vec<&str>, SpeedProfile, TargetCount)) {
        let opts = Opts::parse_from(input);

        assert_eq!(opts.ranges, expected.0);
        assert_eq!(opts.speed, expected.1);
        assert_eq!(opts.target, expected.2);
        assert_eq!(opts.ports(), DEFAULT_PORTS.to_vec());
    }

    #[test]
    fn zero_target_is_rejected() {
        assert!(Opts::try_parse_from(["cdnscan", "-t", "0"]).is_err());
    }

    #[test]
    fn opts_no_merge_when_config_is_ignored() {
        let mut opts = Opts::default();
        let config = Config::sample();

        opts.merge(&config);

        assert_eq!(opts.ranges, vec![] as Vec<String>);
        assert!(!opts.accessible);
        assert_eq!(opts.speed, SpeedProfile::Hyper);
        assert_eq!(opts.ports, None);
    }

    #[test]
    fn opts_merge_required_arguments() {
        let mut opts = Opts::default();
        let config = Config::sample();

        opts.merge_required(&config);

        assert_eq!(opts.ranges, config.ranges.unwrap());
        assert_eq!(opts.speed, SpeedProfile::Deep);
        assert_eq!(opts.target, TargetCount::Bounded(25));
        assert_eq!(opts.ping_max, 800);
        assert_eq!(opts.ping_min, 0);
        assert!(opts.accessible);
    }

    #[test]
    fn opts_merge_optional_arguments() {
        let mut opts = Opts::default();
        let config = Config::sample();

        opts.merge_optional(&config);

        assert_eq!(opts.ports(), vec![2053, 443]);
        assert_eq!(opts.workers, Some(64));
        assert_eq!(opts.ulimit, None);
    }

    #[test]
    fn cli_ports_win_over_config() {
        let mut opts = Opts {
            ports: Some(vec![8443]),
            ..Opts::default()
        };
        opts.merge_optional(&Config::sample());
        assert_eq!(opts.ports(), vec![8443]);
    }

    #[test]
    fn config_parses_from_toml() {
        let config: Config = toml::from_str(
            r#"
            ranges = ["104.16.0.0/13"]
            speed = "turbo"
            target = "all"
            ping_max = 700
            "#,
        )
        .unwrap();
        assert_eq!(config.speed, Some(SpeedProfile::Turbo));
        assert_eq!(config.target, Some(TargetCount::Unbounded));
        assert_eq!(config.ping_max, Some(700));

        let config: Config = toml::from_str("target = 40").unwrap();
        assert_eq!(config.target, Some(TargetCount::Bounded(40)));
        assert!(toml::from_str::<Config>("target = 0").is_err());
    }

    #[parameterized(
        profile = {SpeedProfile::Hyper, SpeedProfile::Turbo, SpeedProfile::Ultra, SpeedProfile::Deep},
        per_block = {30, 50, 80, 120}
    )]
    fn profile_density(profile: SpeedProfile, per_block: usize) {
        assert_eq!(profile.addresses_per_block(), per_block);
    }

    #[test]
    fn profile_label() {
        assert_eq!(SpeedProfile::Turbo.to_string(), "Turbo (40%)");
    }

    #[test]
    fn test_parse_ports_and_ranges_keeps_order() {
        let result = parse_ports_and_ranges("443,80,8443");
        assert_eq!(result, Ok(vec![443, 80, 8443]));
    }

    #[test]
    fn test_parse_ports_and_ranges_single_range() {
        let result = parse_ports_and_ranges("2050-2053");
        assert_eq!(result, Ok(vec![2050, 2051, 2052, 2053]));
    }

    #[test]
    fn test_parse_ports_and_ranges_mixed_with_spaces() {
        let result = parse_ports_and_ranges("443, 1-3, 80");
        assert_eq!(result, Ok(vec![443, 1, 2, 3, 80]));
    }

    #[test]
    fn test_parse_ports_and_ranges_duplicates_keep_first() {
        let result = parse_ports_and_ranges("80,443,80,1-443");
        assert_eq!(result.map(|p| p[..2].to_vec()), Ok(vec![80, 443]));
    }

    #[test]
    fn test_parse_ports_and_ranges_empty_input() {
        let result = parse_ports_and_ranges(" , ");
        assert!(result
            .unwrap_err()
            .contains("No valid ports or ranges provided"));
    }

    #[parameterized(input = {
        "80,abc,443", "80,1-abc,443", "80,1-2-3,443", "80,5-1,443", "80,70000,443", "80,0,443", "0-10"
    }, message = {
        "Invalid port number 'abc'",
        "Invalid end port 'abc' in range '1-abc'",
        "Invalid range format '1-2-3'. Expected 'start-end'",
        "Start port 5 is greater than end port 1 in range '5-1'",
        "Invalid port number '70000'",
        "Port 0 must be between 1 and 65535",
        "Ports in range '0-10' must be between 1 and 65535",
    })]
    fn test_parse_ports_and_ranges_errors(input: &str, message: &str) {
        let error = parse_ports_and_ranges(input).unwrap_err();
        assert!(error.contains(message), "{error}");
    }
}
