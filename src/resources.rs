//! Configured resources and their target tables.
//!
//! `qbo-sync resources` lists every resource descriptor with its remote type,
//! its `raw` table and how many rows that table holds, followed by a check
//! that the credential store can resolve every secret a run needs.

use anyhow::Result;

use crate::config::Config;
use crate::credentials;
use crate::sink::IdempotentSink;

/// Status of one configured resource.
#[derive(Debug, Clone)]
pub struct ResourceStatus {
    pub name: String,
    pub type_name: String,
    pub table: String,
    pub rows: i64,
}

pub async fn get_resources(config: &Config, sink: &IdempotentSink) -> Result<Vec<ResourceStatus>> {
    let mut out = Vec::new();
    for resource in config.resources() {
        let rows = sink.count(&resource.table).await?;
        out.push(ResourceStatus {
            table: resource.qualified_table(),
            name: resource.name,
            type_name: resource.type_name,
            rows,
        });
    }
    Ok(out)
}

/// Names of the secrets a run needs that the configured store cannot resolve.
pub fn missing_secrets(config: &Config) -> Result<Vec<String>> {
    let store = credentials::open_store(&config.credentials)?;
    let names = &config.credentials;
    Ok([
        &names.client_id,
        &names.client_secret,
        &names.refresh_token,
        &names.realm_id,
    ]
    .into_iter()
    .filter(|name| store.get_secret_value(name).is_err())
    .cloned()
    .collect())
}

pub async fn list_resources(config: &Config) -> Result<()> {
    let sink = IdempotentSink::open(config).await?;
    let statuses = get_resources(config, &sink).await?;
    sink.close().await;

    println!("{:<16} {:<16} {:<24} ROWS", "RESOURCE", "TYPE", "TABLE");
    for s in &statuses {
        println!("{:<16} {:<16} {:<24} {}", s.name, s.type_name, s.table, s.rows);
    }

    println!();
    match missing_secrets(config) {
        Ok(missing) if missing.is_empty() => {
            println!("credentials: {} (all secrets present)", config.credentials.provider)
        }
        Ok(missing) => println!(
            "credentials: {} (missing: {})",
            config.credentials.provider,
            missing.join(", ")
        ),
        Err(e) => println!("credentials: {} (unavailable: {})", config.credentials.provider, e),
    }

    Ok(())
}
