use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "domain-lock workspace automation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lock benchmarks once per configuration profile
    Bench {
        /// Run quickly (lower sample size/time)
        #[arg(long, default_value_t = false)]
        quick: bool,

        /// Generate report only (skip running benchmarks)
        #[arg(long, default_value_t = false)]
        report_only: bool,
    },
}

/// (baseline name, `LockConfig` JSON handed to the bench through the environment)
const PROFILES: &[(&str, &str)] = &[
    ("default", "{}"),
    ("no-spin", r#"{ "spin_before_inflate": false }"#),
    ("one-shard", r#"{ "global_lock_count": 1, "fat_locks_per_shard": 0 }"#),
];

const REFERENCE: &str = "default";

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Bench { quick, report_only } => {
            if !report_only {
                run_benchmarks(quick)?;
            }
            generate_report()?;
        }
    }

    Ok(())
}

fn run_benchmarks(quick: bool) -> Result<()> {
    println!("Compiling benchmarks...");
    let status = Command::new("cargo")
        .args(["build", "--bench", "domain_benchmark", "--release"])
        .status()?;
    if !status.success() {
        anyhow::bail!("Failed to compile benchmarks");
    }

    for (profile, config) in PROFILES {
        println!("\n>>> Benchmarking profile: {profile}");
        let start = Instant::now();

        let mut cmd = Command::new("cargo");
        cmd.env("CARGO_INCREMENTAL", "0")
            .env("DOMAIN_LOCK_CONFIG", config);
        cmd.args(["bench", "--bench", "domain_benchmark", "--"]);
        cmd.arg("--save-baseline").arg(profile);

        if quick {
            cmd.arg("--measurement-time").arg("0.1");
            cmd.arg("--noplot");
            cmd.arg("--sample-size").arg("10");
        }

        let status = cmd
            .status()
            .with_context(|| format!("Failed to run bench for profile {profile}"))?;

        if status.success() {
            println!("Finished {profile} in {:.2?}", start.elapsed());
        } else {
            eprintln!("Warning: benchmark failed for profile {profile}");
        }
    }

    Ok(())
}

fn generate_report() -> Result<()> {
    println!("\n>>> Generating Report...");
    let mut results: HashMap<String, HashMap<String, f64>> = HashMap::new();

    let criterion_dir = Path::new("target/criterion");
    if !criterion_dir.exists() {
        eprintln!("No criterion output found at {}", criterion_dir.display());
        return Ok(());
    }

    collect_results(criterion_dir, &mut results);

    let report_path = Path::new("benchmark_results/report.md");
    if let Some(parent) = report_path.parent() {
        fs::create_dir_all(parent)?;
    }

    use std::io::Write;
    let mut file = fs::File::create(report_path)?;

    writeln!(file, "# Lock Benchmark Report")?;
    writeln!(file)?;

    let mut workloads: Vec<_> = results.keys().collect();
    workloads.sort();

    write!(file, "| Workload |")?;
    for (profile, _) in PROFILES {
        write!(file, " {profile} (Ops/s) | vs {REFERENCE} |")?;
    }
    writeln!(file)?;

    write!(file, "|---|")?;
    for _ in PROFILES {
        write!(file, "---|---|")?;
    }
    writeln!(file)?;

    for workload in workloads {
        write!(file, "| {workload} |")?;

        let by_profile = &results[workload];
        let reference = by_profile.get(REFERENCE).copied().unwrap_or(0.0);

        for (profile, _) in PROFILES {
            if let Some(ops) = by_profile.get(*profile) {
                let rel = if reference > 0.0 { ops / reference } else { 0.0 };
                write!(file, " {} | **{rel:.2}x** |", format_ops(*ops))?;
            } else {
                write!(file, " N/A | - |")?;
            }
        }
        writeln!(file)?;
    }

    println!("Report written to {}", report_path.display());
    Ok(())
}

fn format_ops(ops: f64) -> String {
    if ops > 1_000_000.0 {
        format!("{:.2}M", ops / 1_000_000.0)
    } else if ops > 1_000.0 {
        format!("{:.2}K", ops / 1_000.0)
    } else {
        format!("{ops:.0}")
    }
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name()?.to_str().map(str::to_owned)
}

fn read_json(path: &Path) -> Option<serde_json::Value> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Walks `target/criterion`, whose layout is `<group>/<bench>/<baseline>/estimates.json`.
fn collect_results(dir: &Path, results: &mut HashMap<String, HashMap<String, f64>>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_results(&path, results);
            continue;
        }
        if path.file_name().and_then(|s| s.to_str()) != Some("estimates.json") {
            continue;
        }

        let Some(baseline_dir) = path.parent() else {
            continue;
        };
        let Some(bench_dir) = baseline_dir.parent() else {
            continue;
        };
        let (Some(baseline), Some(bench)) = (dir_name(baseline_dir), dir_name(bench_dir)) else {
            continue;
        };
        if baseline == "report" || bench == "report" || baseline == "new" || baseline == "base" {
            continue;
        }
        let workload = match bench_dir.parent().and_then(dir_name) {
            Some(group) if group != "criterion" => format!("{group}/{bench}"),
            _ => bench,
        };

        let elements = read_json(&bench_dir.join("benchmark.json"))
            .and_then(|json| json.get("throughput")?.get("Elements")?.as_f64());

        let Some(time_ns) = read_json(&path)
            .and_then(|json| json.get("mean")?.get("point_estimate")?.as_f64())
        else {
            continue;
        };
        if time_ns <= 0.0 {
            continue;
        }

        let metric = elements.unwrap_or(1.0) * 1e9 / time_ns;
        results.entry(workload).or_default().insert(baseline, metric);
    }
}
