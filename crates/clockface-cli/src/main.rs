use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

// `#[zbus::proxy]` generates `AttendanceProxy` (async) and `AttendanceProxyBlocking`.
#[zbus::proxy(
    interface = "org.clockface.Attendance1",
    default_service = "org.clockface.Attendance1",
    default_path = "/org/clockface/Attendance1"
)]
trait Attendance {
    async fn register_employee(
        &self,
        employee_id: &str,
        full_name: &str,
        email: &str,
        phone: &str,
    ) -> zbus::Result<String>;
    async fn deactivate_employee(&self, employee_id: &str) -> zbus::Result<bool>;
    async fn list_employees(&self, active_only: bool) -> zbus::Result<String>;
    async fn enroll(&self, employee_id: &str, captures: Vec<Vec<u8>>) -> zbus::Result<String>;
    async fn verify(
        &self,
        action: &str,
        capture: Vec<u8>,
        location: &str,
        device_info: &str,
        client_timestamp: &str,
    ) -> zbus::Result<String>;
    async fn identify(&self, capture: Vec<u8>) -> zbus::Result<String>;
    async fn history(&self, from: &str, to: &str, employee_id: &str) -> zbus::Result<String>;
    async fn today_status(&self, date: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "clockface", about = "Clockface face attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an employee in the directory
    Register {
        employee_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Deactivate an employee
    Deactivate { employee_id: String },
    /// List employees with their enrolled embedding counts
    Employees {
        /// Include deactivated employees
        #[arg(long)]
        all: bool,
    },
    /// Enroll face images for an employee
    Enroll {
        employee_id: String,
        /// Image files (JPEG, PNG, ...), one per sample
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Check in with a face image
    CheckIn(Punch),
    /// Check out with a face image
    CheckOut(Punch),
    /// Identify a face without recording attendance
    Identify { image: PathBuf },
    /// Show attendance history, newest first
    History {
        /// First date, YYYY-MM-DD
        #[arg(long)]
        from: Option<String>,
        /// Last date, YYYY-MM-DD
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        employee: Option<String>,
    },
    /// Show counts for today (or --date)
    Today {
        #[arg(long)]
        date: Option<String>,
    },
    /// Show daemon status
    Status,
}

#[derive(clap::Args)]
struct Punch {
    image: PathBuf,
    #[arg(long)]
    location: Option<String>,
    /// Device description as a JSON object
    #[arg(long)]
    device: Option<String>,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(value)
}

/// Whether the daemon's JSON body reports success under `flag`.
fn succeeded(value: &Value, flag: &str) -> bool {
    value.get(flag).and_then(Value::as_bool).unwrap_or(false)
}

/// Exit non-zero when the daemon reports a refusal in the JSON body.
fn outcome(value: &Value, flag: &str) -> ExitCode {
    if succeeded(value, flag) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn punch(proxy: &AttendanceProxy<'_>, action: &str, punch: Punch) -> Result<ExitCode> {
    let capture = read_image(&punch.image)?;
    let raw = proxy
        .verify(
            action,
            capture,
            punch.location.as_deref().unwrap_or(""),
            punch.device.as_deref().unwrap_or(""),
            &chrono::Utc::now().to_rfc3339(),
        )
        .await?;
    let value = print_json(&raw)?;
    Ok(outcome(&value, "success"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let builder = if cli.system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(30))
        .build()
        .await
        .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn).await?;
    tracing::debug!(system = cli.system, "connected");

    match cli.command {
        Commands::Register {
            employee_id,
            name,
            email,
            phone,
        } => {
            let raw = proxy
                .register_employee(&employee_id, &name, &email, phone.as_deref().unwrap_or(""))
                .await?;
            print_json(&raw)?;
        }
        Commands::Deactivate { employee_id } => {
            if !proxy.deactivate_employee(&employee_id).await? {
                eprintln!("No employee {employee_id}");
                return Ok(ExitCode::FAILURE);
            }
            println!("Deactivated {employee_id}");
        }
        Commands::Employees { all } => {
            let raw = proxy.list_employees(!all).await?;
            print_json(&raw)?;
        }
        Commands::Enroll { employee_id, images } => {
            let captures = images
                .iter()
                .map(|p| read_image(p))
                .collect::<Result<Vec<_>>>()?;
            println!("Enrolling {employee_id} from {} image(s)...", captures.len());
            let raw = proxy.enroll(&employee_id, captures).await?;
            let value = print_json(&raw)?;
            return Ok(outcome(&value, "accepted"));
        }
        Commands::CheckIn(p) => return punch(&proxy, "check_in", p).await,
        Commands::CheckOut(p) => return punch(&proxy, "check_out", p).await,
        Commands::Identify { image } => {
            let raw = proxy.identify(read_image(&image)?).await?;
            let value = print_json(&raw)?;
            return Ok(outcome(&value, "recognized"));
        }
        Commands::History { from, to, employee } => {
            let raw = proxy
                .history(
                    from.as_deref().unwrap_or(""),
                    to.as_deref().unwrap_or(""),
                    employee.as_deref().unwrap_or(""),
                )
                .await?;
            print_json(&raw)?;
        }
        Commands::Today { date } => {
            let raw = proxy.today_status(date.as_deref().unwrap_or("")).await?;
            print_json(&raw)?;
        }
        Commands::Status => {
            let raw = proxy.status().await?;
            print_json(&raw)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_in() {
        let cli = Cli::parse_from([
            "clockface", "--system", "check-in", "me.jpg", "--location", "gate 2",
        ]);
        assert!(cli.system);
        match cli.command {
            Commands::CheckIn(p) => {
                assert_eq!(p.image, PathBuf::from("me.jpg"));
                assert_eq!(p.location.as_deref(), Some("gate 2"));
                assert!(p.device.is_none());
            }
            _ => panic!("expected check-in"),
        }
    }

    #[test]
    fn test_employees_defaults_to_active_only() {
        let cli = Cli::parse_from(["clockface", "employees"]);
        assert!(matches!(cli.command, Commands::Employees { all: false }));
        let cli = Cli::parse_from(["clockface", "employees", "--all"]);
        assert!(matches!(cli.command, Commands::Employees { all: true }));
    }

    #[test]
    fn test_enroll_requires_images() {
        assert!(Cli::try_parse_from(["clockface", "enroll", "E001"]).is_err());
    }

    #[test]
    fn test_outcome_flag() {
        assert!(succeeded(&json!({"success": true}), "success"));
        assert!(!succeeded(&json!({"success": false}), "success"));
        assert!(!succeeded(&json!({"accepted": "yes"}), "accepted"));
        assert!(!succeeded(&json!({}), "accepted"));
    }
}
