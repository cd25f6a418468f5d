//! Command-line arguments, parsed by hand.
//!
//! ```text
//! aqi-dashboard [--env-file PATH] [--zip Z]... [--from YYYY-MM] [--to YYYY-MM]
//!               [--month YYYY-MM] [--json] [--watch SECS]
//! aqi-dashboard [--env-file PATH] generate --out PATH [--days N] [--sensors N] [--seed N]
//! ```
//!
//! Value flags accept both `--flag value` and `--flag=value`.

use crate::db::models::HourlyReading;
use crate::filter::{self, parse_year_month, ReadingFilter};
use crate::services::generate;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Cli {
    pub env_file: Option<PathBuf>,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Dashboard(DashboardArgs),
    Generate(GenerateArgs),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardArgs {
    /// Empty keeps every ZIP code.
    pub zip_codes: BTreeSet<String>,
    pub from: Option<(i32, u32)>,
    pub to: Option<(i32, u32)>,
    pub month: Option<(i32, u32)>,
    pub json: bool,
    pub watch: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateArgs {
    pub out: PathBuf,
    pub days: u32,
    pub sensors: usize,
    pub seed: u64,
}

/// Parse the arguments that follow the program name.
pub fn parse<I>(args: I) -> Result<Cli, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args
        .into_iter()
        .map(|a| a.into_string().map_err(|_| "argument contains invalid UTF-8".to_string()))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter();

    let mut env_file: Option<PathBuf> = None;
    let mut dashboard = DashboardArgs::default();
    let mut generate: Option<GenerateBuilder> = None;

    while let Some(arg) = args.next() {
        if arg == "generate" && generate.is_none() {
            generate = Some(GenerateBuilder::default());
            continue;
        }
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
            _ => (arg.clone(), None),
        };
        let mut value = |name: &str| -> Result<String, String> {
            let v = match inline.clone() {
                Some(v) => v,
                None => args.next().ok_or_else(|| format!("`{}` requires a value", name))?,
            };
            if v.is_empty() {
                return Err(format!("`{}` requires a value", name));
            }
            Ok(v)
        };

        match (flag.as_str(), generate.as_mut()) {
            ("--env-file", _) => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                env_file = Some(PathBuf::from(value("--env-file")?));
            }
            ("--out", Some(g)) => g.out = Some(PathBuf::from(value("--out")?)),
            ("--days", Some(g)) => g.days = number(&value("--days")?, "--days")?,
            ("--sensors", Some(g)) => g.sensors = number(&value("--sensors")?, "--sensors")?,
            ("--seed", Some(g)) => g.seed = number(&value("--seed")?, "--seed")?,
            ("--zip", None) => {
                dashboard.zip_codes.insert(value("--zip")?);
            }
            ("--from", None) => dashboard.from = Some(parse_year_month(&value("--from")?)?),
            ("--to", None) => dashboard.to = Some(parse_year_month(&value("--to")?)?),
            ("--month", None) => dashboard.month = Some(parse_year_month(&value("--month")?)?),
            ("--json", None) if inline.is_none() => dashboard.json = true,
            ("--watch", None) => {
                let secs: u64 = number(&value("--watch")?, "--watch")?;
                if secs == 0 {
                    return Err("`--watch` must be at least 1 second".to_string());
                }
                dashboard.watch = Some(Duration::from_secs(secs));
            }
            ("--", _) => break,
            (other, _) => return Err(format!("unrecognised argument: {}", other)),
        }
    }

    if let (Some(from), Some(to)) = (dashboard.from, dashboard.to)
        && to < from
    {
        return Err(format!(
            "`--to` {:04}-{:02} is before `--from` {:04}-{:02}",
            to.0, to.1, from.0, from.1
        ));
    }

    let command = match generate {
        Some(g) => Command::Generate(g.finish()?),
        None => Command::Dashboard(dashboard),
    };
    Ok(Cli { env_file, command })
}

impl DashboardArgs {
    /// Filter for the chosen ZIP codes and months. An open end of the range
    /// falls back to the first or last month present in `rows`.
    pub fn selection(&self, rows: &[HourlyReading]) -> Result<ReadingFilter, String> {
        let zip_codes = (!self.zip_codes.is_empty()).then(|| self.zip_codes.clone());
        let months = filter::available_months(rows);
        let (from, to) = match (self.from, self.to) {
            (None, None) => {
                return Ok(ReadingFilter {
                    zip_codes,
                    ..ReadingFilter::default()
                });
            }
            (Some(from), Some(to)) => (from, to),
            (Some(from), None) => (from, months.last().copied().unwrap_or(from).max(from)),
            (None, Some(to)) => (months.first().copied().unwrap_or(to).min(to), to),
        };
        ReadingFilter::for_months(zip_codes, from, to)
    }
}

pub fn usage() -> &'static str {
    "usage:\n  \
     aqi-dashboard [--env-file PATH] [--zip Z]... [--from YYYY-MM] [--to YYYY-MM] [--month YYYY-MM] [--json] [--watch SECS]\n  \
     aqi-dashboard [--env-file PATH] generate --out PATH [--days N] [--sensors N] [--seed N]"
}

#[derive(Debug)]
struct GenerateBuilder {
    out: Option<PathBuf>,
    days: u32,
    sensors: usize,
    seed: u64,
}

impl Default for GenerateBuilder {
    fn default() -> Self {
        GenerateBuilder {
            out: None,
            days: generate::DEFAULT_DAYS,
            sensors: generate::DEFAULT_SENSORS,
            seed: generate::DEFAULT_SEED,
        }
    }
}

impl GenerateBuilder {
    fn finish(self) -> Result<GenerateArgs, String> {
        let out = self.out.ok_or_else(|| "`generate` requires `--out PATH`".to_string())?;
        if self.days == 0 {
            return Err("`--days` must be positive".to_string());
        }
        if self.sensors == 0 {
            return Err("`--sensors` must be positive".to_string());
        }
        Ok(GenerateArgs {
            out,
            days: self.days,
            sensors: self.sensors,
            seed: self.seed,
        })
    }
}

fn number<T: FromStr>(raw: &str, flag: &str) -> Result<T, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("`{}` expects a non-negative integer, got {:?}", flag, raw))
}
