use rulepay_core::config::{AppConfig, LoadOptions};
use rulepay_core::context::{ContextProvider, InMemoryFinancialDataset};
use rulepay_db::{connect_with_config, migrations, ping};
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Fail { 1 } else { 0 };

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return CommandResult { exit_code, output };
    }

    CommandResult { exit_code, output: render_human(&report) }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_signing_secret(&config));
            checks.extend(check_database(&config));
            checks.push(check_dataset(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["signing_secret", "database_connectivity", "schema_migrations", "dataset"]
            {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_signing_secret(config: &AppConfig) -> DoctorCheck {
    match config.scheduler.signing_secret {
        Some(_) => DoctorCheck {
            name: "signing_secret",
            status: CheckStatus::Pass,
            details: "execute requests must carry a valid x-rulepay-signature".to_string(),
        },
        None => DoctorCheck {
            name: "signing_secret",
            status: CheckStatus::Warn,
            details: "no signing secret configured; execute requests are accepted unsigned"
                .to_string(),
        },
    }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    DoctorCheck {
                        name: "schema_migrations",
                        status: CheckStatus::Skipped,
                        details: "skipped because the database is unreachable".to_string(),
                    },
                ];
            }
        };

        let connectivity = match ping(&pool).await {
            Ok(()) => DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.database.url),
            },
            Err(error) => DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("database query failed: {error}"),
            },
        };

        let schema = match migrations::pending_versions(&pool).await {
            Ok(pending) if pending.is_empty() => DoctorCheck {
                name: "schema_migrations",
                status: CheckStatus::Pass,
                details: "audit trail schema is up to date".to_string(),
            },
            Ok(pending) => DoctorCheck {
                name: "schema_migrations",
                status: CheckStatus::Warn,
                details: format!(
                    "{} migration(s) pending; run `rulepay migrate` or start the server",
                    pending.len()
                ),
            },
            Err(error) => DoctorCheck {
                name: "schema_migrations",
                status: CheckStatus::Fail,
                details: format!("failed to inspect migrations: {error}"),
            },
        };

        pool.close().await;
        vec![connectivity, schema]
    })
}

fn check_dataset(config: &AppConfig) -> DoctorCheck {
    let loaded = InMemoryFinancialDataset::load(config.pipeline.dataset_path.as_deref())
        .and_then(|dataset| dataset.snapshot());

    match loaded {
        Ok(snapshot) => DoctorCheck {
            name: "dataset",
            status: CheckStatus::Pass,
            details: format!(
                "{} accounts, {} beneficiaries, {} invoices",
                snapshot.accounts.len(),
                snapshot.beneficiaries.len(),
                snapshot.invoices.len()
            ),
        },
        Err(error) => {
            DoctorCheck { name: "dataset", status: CheckStatus::Fail, details: error.to_string() }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
