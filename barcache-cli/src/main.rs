//! Barcache CLI: query 4h bars, rank rising streaks, inspect the cache.
//!
//! Commands:
//! - `bars`: answer a range query, gap-filling from the configured source
//! - `streak`: rank symbols by consecutive rising 4h closes
//! - `cache status`: per-symbol bar count, period range and digest

use anyhow::{Context, Result};
use barcache_core::streak::{rank_streaks, rising_streak, RankedStreak};
use barcache_core::cache::Inspection;
use barcache_core::{AggregationService, AppConfig, CacheStore, QueryResult};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "barcache", about = "Barcache CLI: 4h candles from 15m records, cached")]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print 4h bars for a symbol and range.
    Bars {
        #[arg(long)]
        symbol: String,

        /// Range start (RFC 3339 or YYYY-MM-DD), inclusive.
        #[arg(long, value_parser = parse_time)]
        start: DateTime<Utc>,

        /// Range end (RFC 3339 or YYYY-MM-DD), exclusive.
        #[arg(long, value_parser = parse_time)]
        end: DateTime<Utc>,

        /// Print bars as JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Rank symbols by consecutive rising 4h closes.
    Streak {
        #[arg(long, required = true, num_args = 1..)]
        symbols: Vec<String>,

        /// How far back to look, in hours.
        #[arg(long, default_value_t = 400)]
        lookback_hours: i64,

        /// Show only the top K symbols.
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Cache inspection commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report bar count, period range and digest per cached symbol.
    /// Read-only: corrupt files are listed, not quarantined.
    Status,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Bars {
            symbol,
            start,
            end,
            json,
        } => run_bars(&config, &symbol, start, end, json),
        Commands::Streak {
            symbols,
            lookback_hours,
            top,
        } => run_streak(&config, &symbols, lookback_hours, top),
        Commands::Cache { action } => match action {
            CacheAction::Status => run_cache_status(&config),
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("barcache=info,barcache_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::default(),
    };
    tracing::debug!(?config, "configuration loaded");
    Ok(config)
}

/// RFC 3339 instant, or a bare date meaning midnight UTC.
fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("'{s}' is neither RFC 3339 nor YYYY-MM-DD"))
}

fn report_issues(result: &QueryResult) {
    for issue in &result.issues {
        eprintln!("{}: {issue}", result.symbol);
    }
}

fn run_bars(
    config: &AppConfig,
    symbol: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    json: bool,
) -> Result<()> {
    let service = AggregationService::from_config(config)?;
    let result = service.get_bars(symbol, start, end)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result.bars)?);
    } else {
        println!(
            "{:<22} {:>14} {:>14} {:>14} {:>14} {:>18}",
            "period_start", "open", "high", "low", "close", "volume"
        );
        for bar in &result.bars {
            println!(
                "{:<22} {:>14} {:>14} {:>14} {:>14} {:>18}",
                bar.period_start.format("%Y-%m-%dT%H:%MZ").to_string(),
                bar.open.to_string(),
                bar.high.to_string(),
                bar.low.to_string(),
                bar.close.to_string(),
                bar.volume.to_string(),
            );
        }
        println!("{} bars in [{}, {})", result.bars.len(), result.start, result.end);
    }

    report_issues(&result);
    if result.is_degraded() {
        std::process::exit(2);
    }
    Ok(())
}

fn run_streak(config: &AppConfig, symbols: &[String], lookback_hours: i64, top: usize) -> Result<()> {
    anyhow::ensure!(lookback_hours > 0, "--lookback-hours must be positive");
    let service = AggregationService::from_config(config)?;
    let end = Utc::now();
    let start = end - Duration::hours(lookback_hours);

    let mut streaks = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let result = service
            .get_bars(symbol, start, end)
            .with_context(|| format!("querying {symbol}"))?;
        report_issues(&result);
        if result.bars.is_empty() {
            continue;
        }
        streaks.push(RankedStreak {
            symbol: symbol.clone(),
            streak: rising_streak(&result.bars),
        });
    }

    println!("{:<14} {:>6} {:>10}", "symbol", "count", "change");
    for ranked in rank_streaks(streaks).into_iter().take(top) {
        println!(
            "{:<14} {:>6} {:>9}%",
            ranked.symbol,
            ranked.streak.count,
            ranked.streak.change_pct.round_dp(2).to_string(),
        );
    }
    Ok(())
}

fn run_cache_status(config: &AppConfig) -> Result<()> {
    let store = CacheStore::from_config(&config.cache, config.anchor()?);
    let symbols = store.symbols()?;
    if symbols.is_empty() {
        println!("No cached symbols in {}", store.dir().display());
        return Ok(());
    }

    println!("Cache: {}", store.dir().display());
    println!(
        "{:<14} {:>6} {:<22} {:<22} digest",
        "symbol", "bars", "first", "last"
    );
    for symbol in symbols {
        let entry = match store.inspect(&symbol)? {
            Inspection::Valid(entry) => entry,
            Inspection::Corrupt(e) => {
                println!("{symbol:<14} corrupt: {e}");
                continue;
            }
            Inspection::Missing => continue,
        };
        let period = |bar: Option<&barcache_core::Candle4h>| {
            bar.map(|b| b.period_start.format("%Y-%m-%dT%H:%MZ").to_string())
                .unwrap_or_else(|| "-".into())
        };
        println!(
            "{:<14} {:>6} {:<22} {:<22} {}",
            symbol,
            entry.len(),
            period(entry.first()),
            period(entry.last()),
            &entry.digest()[..16],
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_and_dates() {
        let midnight = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_time("2024-03-01").unwrap(), midnight);
        assert_eq!(parse_time("2024-03-01T00:00:00Z").unwrap(), midnight);
        assert_eq!(
            parse_time("2024-03-01T08:00:00+08:00").unwrap(),
            midnight
        );
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn cli_parses_bars_command() {
        let cli = Cli::try_parse_from([
            "barcache", "bars", "--symbol", "BTCUSDT", "--start", "2024-03-01", "--end",
            "2024-03-02", "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Bars { symbol, json, .. } => {
                assert_eq!(symbol, "BTCUSDT");
                assert!(json);
            }
            _ => panic!("expected bars command"),
        }
    }

    #[test]
    fn cli_parses_streak_with_global_config() {
        let cli = Cli::try_parse_from([
            "barcache", "streak", "--symbols", "BTC", "ETH", "--lookback-hours", "48",
            "--config", "barcache.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("barcache.toml")));
        match cli.command {
            Commands::Streak { symbols, lookback_hours, top } => {
                assert_eq!(symbols, vec!["BTC", "ETH"]);
                assert_eq!(lookback_hours, 48);
                assert_eq!(top, 10);
            }
            _ => panic!("expected streak command"),
        }
    }
}
