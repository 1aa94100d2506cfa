use chrono::Utc;
use log::info;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Installs the global logger. `level` seeds `RUST_LOG` when it is unset.
/// Safe to call more than once; later calls are ignored.
pub fn init_logger(level: &str) {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", level);
    }
    let installed = env_logger::Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] [{}:{}] {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init()
        .is_ok();

    if installed {
        info!("Thrift reconciler logger initialized");
    }
}

/// Appends a partial-success row (payment mined, fulfillment failed) to a
/// CSV that support works through by hand.
pub fn append_reconciliation_entry(
    log_path: &Path,
    tx_hash: &str,
    reference: &str,
    message: &str,
) -> Result<(), std::io::Error> {
    let needs_header = !log_path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
    if needs_header {
        file.write_all(b"timestamp,tx_hash,reference,message\n")?;
    }

    let entry = format!(
        "{},{},{},{}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        tx_hash,
        quoted(reference),
        quoted(message)
    );
    file.write_all(entry.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn quoted(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "'").replace(['\r', '\n'], " "))
}
