//! forecastpanel: command-line driver for the panel core.
//!
//! Usage:
//!   forecastpanel <command> [args]
//!
//! Commands:
//!   normalize <payload.json>               - Normalize a saved training response
//!   weights <rmse> <rmse> <rmse>           - Resolve ensemble weights ("-" marks a failed model)
//!   forecast <payload.json>                - Print a saved forecast as CSV
//!   train <filename> <model> <date> <target> [category] - Train and normalize the result
//!   analyze <filename> [date_col] [value]  - Run the exploratory queries
//!   refresh <filename> [sheet]             - Fetch and print a dataset schema
//!   health                                 - Check that the backend is reachable

use anyhow::{anyhow, bail, Result};
use serde_json::json;
use std::path::PathBuf;

use forecastpanel::accuracy::SplitAccuracy;
use forecastpanel::analysis::{run_analysis, AnalysisRequest};
use forecastpanel::client::BackendKind;
use forecastpanel::config::Config;
use forecastpanel::ensemble::{resolve_weights, Constituent, ConstituentOutcome};
use forecastpanel::forecast::{parse_forecast, ForecastSession};
use forecastpanel::logging::{log, obj, v_str, Domain, Level};
use forecastpanel::metrics::Split;
use forecastpanel::normalize::{load_payload, normalize, CategoryOutcome, NormalizedResult, TrainingResult};
use forecastpanel::schema::{RefreshOutcome, RefreshTrigger, SchemaSyncManager};
use forecastpanel::validation::TrainingRequest;

fn print_usage() {
    eprintln!("Usage: forecastpanel <command> [args]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  normalize <payload.json>               Normalize a saved training response");
    eprintln!("  weights <rmse> <rmse> <rmse>           Resolve ensemble weights (- marks a failed model)");
    eprintln!("  forecast <payload.json>                Print a saved forecast as CSV");
    eprintln!("  train <filename> <model> <date_col> <target> [category]");
    eprintln!("                                         Train a model and print the normalized result");
    eprintln!("  analyze <filename> [date_col] [value]  Run the exploratory queries");
    eprintln!("  refresh <filename> [sheet]             Fetch and print a dataset schema");
    eprintln!("  health                                 Check that the backend is reachable");
}

fn fmt_pct(v: Option<f64>) -> String {
    v.map(|x| format!("{:.2}%", x)).unwrap_or_else(|| "-".to_string())
}

fn print_accuracy(label: &str, acc: &SplitAccuracy) {
    println!(
        "{:<24} train={:<10} validation={:<10} test={}",
        label,
        fmt_pct(acc.get(Split::Train)),
        fmt_pct(acc.get(Split::Validation)),
        fmt_pct(acc.get(Split::Test))
    );
}

fn print_single(result: &TrainingResult, top_n: usize) {
    println!("family: {:?} ({:?} shape)", result.family, result.shape);
    print_accuracy("accuracy", &result.accuracy());
    if let Some(w) = &result.ensemble_weights {
        for e in w.entries() {
            println!("  {:<8} weight={:.3} status={:?}", e.constituent.key(), e.weight, e.status);
        }
    }
    if let Some(fi) = result.feature_importance.as_ref().filter(|_| result.family.is_tree_based()) {
        println!("top features:");
        for (name, score) in fi.top(top_n) {
            println!("  {:<24} {:.4}", name, score);
        }
    }
    if let Some(leak) = result.leakage.as_ref().filter(|l| l.has_leakage) {
        for issue in &leak.critical {
            println!("leakage: {}", issue.message);
        }
    }
    if let Some(diag) = &result.diagnostic {
        println!("unrecognized payload: {} (keys: {})", diag.reason, diag.keys.join(", "));
    }
}

fn cmd_normalize(path: &str, cfg: &Config) -> Result<()> {
    let raw = load_payload(&PathBuf::from(path))?;
    print_normalized(&raw, cfg);
    Ok(())
}

fn print_normalized(raw: &serde_json::Value, cfg: &Config) {
    match normalize(raw) {
        NormalizedResult::Single(result) => print_single(&result, cfg.feature_importance_top_n),
        NormalizedResult::Partitioned(p) => {
            println!(
                "categories: {} total, {} trained, {} failed (column {})",
                p.total,
                p.successful,
                p.failed,
                p.category_column.as_deref().unwrap_or("-")
            );
            if let Some(agg) = p.aggregated_accuracy() {
                print_accuracy("overall", &agg);
            }
            for (label, outcome) in p.outcomes() {
                match outcome {
                    CategoryOutcome::Trained(_) => {
                        if let Some(acc) = p.category_accuracy(label) {
                            print_accuracy(label, &acc);
                        }
                    }
                    CategoryOutcome::Failed { error, rows } => match rows {
                        Some(n) => println!("{:<24} failed: {} ({} rows)", label, error, n),
                        None => println!("{:<24} failed: {}", label, error),
                    },
                }
            }
        }
    }
}

async fn cmd_train(args: &[String], cfg: &Config) -> Result<()> {
    let [filename, model, date, target, rest @ ..] = args else {
        bail!("train needs <filename> <model> <date_col> <target> [category]");
    };
    let mut request = TrainingRequest::new(filename, model, date, target);
    if let Some(category) = rest.first() {
        request = request.with_category(category);
    }
    request.validate(cfg.split_tolerance)?;
    let backend = BackendKind::from_env().build(cfg)?;
    let raw = backend.train(&request).await?;
    print_normalized(&raw, cfg);
    Ok(())
}

fn cmd_weights(args: &[String]) -> Result<()> {
    if args.len() != 3 {
        bail!("weights needs three RMSE values");
    }
    let mut outcomes = Vec::new();
    for (c, raw) in Constituent::ALL.iter().zip(args) {
        let outcome = if raw == "-" {
            ConstituentOutcome::Failed
        } else {
            let rmse: f64 = raw.parse().map_err(|_| anyhow!("bad RMSE value: {}", raw))?;
            ConstituentOutcome::Trained { rmse }
        };
        outcomes.push((*c, outcome));
    }
    let weights = resolve_weights(&outcomes)?;
    println!("{}", serde_json::to_string_pretty(&weights)?);
    Ok(())
}

fn cmd_forecast(path: &str) -> Result<()> {
    let raw = load_payload(&PathBuf::from(path))?;
    let data = forecastpanel::client::unwrap_envelope(raw)?;
    let result = parse_forecast(&data)?;
    let mut session = ForecastSession::new();
    session.record("saved", None, None, None, result);
    print!("{}", session.to_csv());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let cfg = Config::from_env();
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[("command", v_str(&args[1])), ("api_base_url", v_str(&cfg.api_base_url))]),
    );

    match args[1].as_str() {
        "normalize" => {
            let path = args.get(2).ok_or_else(|| anyhow!("normalize needs a payload file"))?;
            cmd_normalize(path, &cfg)
        }
        "weights" => cmd_weights(&args[2..]),
        "forecast" => {
            let path = args.get(2).ok_or_else(|| anyhow!("forecast needs a payload file"))?;
            cmd_forecast(path)
        }
        "train" => cmd_train(&args[2..], &cfg).await,
        "analyze" => {
            let filename = args.get(2).ok_or_else(|| anyhow!("analyze needs a filename"))?;
            let backend = BackendKind::from_env().build(&cfg)?;
            let mut request = AnalysisRequest::new(filename)
                .with_columns(args.get(3).map(String::as_str), args.get(4).map(String::as_str));
            request.correlation_method = cfg.correlation_method.clone();
            let report = run_analysis(backend.as_ref(), &request, cfg.analysis_timeout()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            for (section, msg) in report.failed() {
                eprintln!("{} failed: {}", section.as_str(), msg);
            }
            Ok(())
        }
        "refresh" => {
            let filename = args.get(2).ok_or_else(|| anyhow!("refresh needs a filename"))?;
            let backend = BackendKind::from_env().build(&cfg)?;
            let mut manager = SchemaSyncManager::new();
            let outcome = manager
                .refresh(
                    backend.as_ref(),
                    filename,
                    args.get(3).map(String::as_str),
                    RefreshTrigger::Manual,
                    cfg.schema_timeout(),
                )
                .await?;
            match (outcome, manager.schema()) {
                (RefreshOutcome::Applied(applied), Some(schema)) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&json!({
                            "schema": schema,
                            "fingerprint": applied.fingerprint,
                        }))?
                    );
                    Ok(())
                }
                (RefreshOutcome::Failed(err), _) => Err(err.into()),
                _ => bail!("schema refresh for {} did not apply", filename),
            }
        }
        "health" => {
            let backend = BackendKind::from_env().build(&cfg)?;
            let ok = backend.health().await.unwrap_or(false);
            println!("{}", if ok { "Backend Connected" } else { "Backend Disconnected" });
            if !ok {
                std::process::exit(2);
            }
            Ok(())
        }
        _ => {
            print_usage();
            std::process::exit(1);
        }
    }
}
