//! # CLI Command Implementations

use crate::api::{self, StatusResponse};
use crate::config::{AppConfig, read_signing_key};
use gnosis_core::messaging::generate_signing_key;
use gnosis_core::{
    AuditRecord, Entity, EntityId, GnosisCore, GnosisError, MessageSigner, Plane,
    Provenance,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::Path;
use std::str::FromStr;

// =============================================================================
// HELPERS
// =============================================================================

/// Open (or create) the redb database with the loaded configuration and
/// register every configured plane key.
pub fn load_core(db_path: &Path, config_path: Option<&Path>) -> Result<GnosisCore, GnosisError> {
    let config = AppConfig::load(config_path)?;
    let signing_key = config.signing_key()?;
    let plane_keys = config.plane_keys()?;

    let core = GnosisCore::with_redb(db_path, config.core, signing_key)?;
    for (plane, key) in plane_keys {
        core.router().register_plane_key(plane, key);
    }
    if core.recovery().index_repairs > 0 {
        tracing::warn!(
            repairs = core.recovery().index_repairs,
            "latest index was rebuilt from the entity log"
        );
    }
    Ok(core)
}

fn print_json(value: &impl Serialize) -> Result<(), GnosisError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| GnosisError::Serialization(format!("output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

pub async fn cmd_server(
    db_path: &Path,
    config_path: Option<&Path>,
    host: &str,
    port: u16,
) -> Result<(), GnosisError> {
    let core = load_core(db_path, config_path)?;
    let public_key = hex::encode(core.router().verifying_key().to_bytes());

    println!("Gnosis Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:       {}", host);
    println!("  Port:       {}", port);
    println!("  Database:   {}", db_path.display());
    println!("  Core key:   {}", public_key);
    println!();
    println!("Endpoints:");
    println!("  POST /message - Deliver a signed message");
    println!("  GET  /status  - Subsystem counts");
    println!("  GET  /plugins - Registered operations");
    println!("  GET  /health  - Health check");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let addr = format!("{}:{}", host, port);
    api::run_server(&addr, core).await
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

pub fn cmd_status(
    db_path: &Path,
    config_path: Option<&Path>,
    json_mode: bool,
) -> Result<(), GnosisError> {
    let core = load_core(db_path, config_path)?;
    let status = StatusResponse::from_core(&core);

    if json_mode {
        print_json(&status)?;
        return Ok(());
    }

    println!("Gnosis Status");
    println!("=============");
    println!("Database:     {}", db_path.display());
    println!();
    println!("Entities:     {}", status.entities);
    println!("Versions:     {}", status.versions);
    println!("Memories:     {}", status.memories);
    println!("Self levels:  {}", status.self_model_levels);
    println!("Plugins:      {}", status.plugins);
    println!("Audit:        {}", status.audit_records);
    println!("Core key:     {}", status.core_public_key);
    Ok(())
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create a fresh database holding a base self named `name`.
pub fn cmd_init(
    db_path: &Path,
    config_path: Option<&Path>,
    json_mode: bool,
    force: bool,
    name: &str,
) -> Result<(), GnosisError> {
    if db_path.exists() {
        if !force {
            return Err(GnosisError::Precondition(format!(
                "database '{}' already exists (use --force to replace it)",
                db_path.display()
            )));
        }
        if !db_path.is_file() {
            return Err(GnosisError::Precondition(format!(
                "'{}' is not a regular file",
                db_path.display()
            )));
        }
        std::fs::remove_file(db_path)
            .map_err(|e| GnosisError::Storage(format!("remove database: {}", e)))?;
    }

    let core = load_core(db_path, config_path)?;
    let base = core
        .selfmap()
        .create_base_self(json!({ "name": name }), Provenance::new(core.clock().now()))?;

    if json_mode {
        print_json(&json!({
            "database": db_path.to_string_lossy(),
            "base_self": base.entity_id.to_string(),
        }))?;
    } else {
        println!("Initialized {}", db_path.display());
        println!("Base self:  {}", base.entity_id);
    }
    Ok(())
}

// =============================================================================
// HISTORY COMMAND
// =============================================================================

pub fn cmd_history(
    db_path: &Path,
    config_path: Option<&Path>,
    json_mode: bool,
    id: &str,
) -> Result<(), GnosisError> {
    let id = EntityId::from_str(id)?;
    let core = load_core(db_path, config_path)?;
    let history = core.store().history(id)?;

    if json_mode {
        let versions: Vec<&Entity> = history.iter().collect();
        print_json(&versions)?;
        return Ok(());
    }

    println!("History of {} ({} versions)", id, history.len());
    for entity in history.iter() {
        let tx = entity
            .tx_id
            .map(|tx| tx.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  v{:<4} {}  by {}  tx {}",
            entity.version, entity.committed_at, entity.created_by, tx
        );
    }
    Ok(())
}

// =============================================================================
// AUDIT COMMAND
// =============================================================================

pub fn cmd_audit(
    db_path: &Path,
    config_path: Option<&Path>,
    json_mode: bool,
    operation: Option<&str>,
    limit: usize,
) -> Result<(), GnosisError> {
    let core = load_core(db_path, config_path)?;
    let records = match operation {
        Some(operation) => core.audit().by_operation(operation)?,
        None => core.audit().records()?,
    };
    let skip = records.len().saturating_sub(limit);
    let shown: Vec<&AuditRecord> = records.iter().skip(skip).collect();

    if json_mode {
        print_json(&shown)?;
        return Ok(());
    }

    for record in shown {
        println!(
            "#{:<6} {}  {:<8} {:<20} {}  {}",
            record.seq,
            record.timestamp,
            record.outcome,
            record.operation,
            record.actor,
            record.detail
        );
    }
    Ok(())
}

// =============================================================================
// KEY COMMANDS
// =============================================================================

pub fn cmd_keygen(output: Option<&Path>, force: bool, json_mode: bool) -> Result<(), GnosisError> {
    let key = generate_signing_key();
    let secret = hex::encode(key.to_bytes());
    let public = hex::encode(key.verifying_key().to_bytes());

    if let Some(path) = output {
        if path.exists() && !force {
            return Err(GnosisError::Precondition(format!(
                "key file '{}' already exists (use --force to replace it)",
                path.display()
            )));
        }
        std::fs::write(path, &secret)
            .map_err(|e| GnosisError::Storage(format!("write key: {}", e)))?;
    }

    if json_mode {
        let mut out = json!({ "public_key": public });
        if output.is_none() {
            out["secret_key"] = Value::String(secret);
        }
        print_json(&out)?;
    } else {
        if let Some(path) = output {
            println!("Secret key: written to {}", path.display());
        } else {
            println!("Secret key: {}", secret);
        }
        println!("Public key: {}", public);
    }
    Ok(())
}

/// Build and sign an envelope from `from` to `to`, printing the JSON message.
pub fn cmd_sign(
    key_path: &Path,
    from: &str,
    to: &str,
    op: &str,
    payload: &str,
) -> Result<(), GnosisError> {
    let key = read_signing_key(key_path)?;
    let from = Plane::from_str(from)?;
    let to = Plane::from_str(to)?;
    let payload: Value = serde_json::from_str(payload)
        .map_err(|e| GnosisError::Serialization(format!("payload: {}", e)))?;

    let message = MessageSigner::new(from, key).sign(to, op, payload, chrono::Utc::now())?;
    println!("{}", message.to_json()?);
    Ok(())
}

// =============================================================================
// VERIFY COMMAND
// =============================================================================

/// Walk the self-model chain and check the audit sequence has no gaps.
pub fn cmd_verify(
    db_path: &Path,
    config_path: Option<&Path>,
    json_mode: bool,
) -> Result<(), GnosisError> {
    let core = load_core(db_path, config_path)?;
    let chain_length = core.selfmap().verify_chain()?;

    let records = core.audit().records()?;
    if let Some((expected, record)) = records
        .iter()
        .enumerate()
        .find(|(i, record)| record.seq != *i as u64)
    {
        return Err(GnosisError::Validation(format!(
            "audit sequence gap: expected #{}, found #{}",
            expected, record.seq
        )));
    }

    let recovery = core.recovery();
    if json_mode {
        print_json(&json!({
            "self_model_levels": chain_length,
            "audit_records": records.len(),
            "entities": recovery.entities,
            "versions": recovery.versions,
            "index_repairs": recovery.index_repairs,
        }))?;
    } else {
        println!("Self-model chain: {} levels OK", chain_length);
        println!("Audit sequence:   {} records OK", records.len());
        println!(
            "Recovery:         {} entities, {} versions, {} index repairs",
            recovery.entities, recovery.versions, recovery.index_repairs
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn print_json_reports_unserializable_output() {
        assert!(print_json(&json!({"ok": true})).is_ok());

        let tuple_keys = BTreeMap::from([((1_u8, 2_u8), "pair")]);
        assert!(matches!(
            print_json(&tuple_keys),
            Err(GnosisError::Serialization(_))
        ));
    }
}
