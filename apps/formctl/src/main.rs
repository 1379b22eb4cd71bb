mod cli;
mod config;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    ClientConfig, Form, FormNode, HttpTransport, MemoryNode, NodeRef, PrecognitiveForm,
    ValidationOutcome, VisitOutcome,
};
use serde_json::Value;
use shared::{
    domain::InputKind,
    protocol::{FieldValue, FileUpload, Payload},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, FormArgs};
use config::load_settings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = load_settings(&cli.config);
    cli.apply_overrides(&mut config);
    info!(
        debounce_ms = config.debounce_ms,
        timeout_ms = config.timeout_ms,
        fence = config.fence_stale_responses,
        "settings loaded"
    );

    match cli.command {
        Command::Submit(form) => submit(form, config).await,
        Command::Validate { form, only } => validate(form, only, config).await,
    }
}

async fn read_payload(args: &FormArgs) -> Result<Payload> {
    let mut payload = Payload::new();
    for (name, value) in &args.fields {
        payload.insert(name.clone(), value.clone());
    }
    for (name, path) in &args.files {
        payload.insert(name.clone(), read_upload(path).await?);
    }
    Ok(payload)
}

async fn read_upload(path: &Path) -> Result<FieldValue> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read upload '{}'", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    Ok(FieldValue::File(FileUpload {
        file_name,
        content_type: None,
        bytes,
    }))
}

fn print_node_errors(node: &MemoryNode) {
    let snapshot = node.snapshot();
    for message in &snapshot.errors {
        println!("{}: {message}", node.name());
    }
    for (field, message) in &snapshot.field_errors {
        println!("  {field}: {message}");
    }
}

async fn submit(args: FormArgs, config: ClientConfig) -> Result<()> {
    let payload = read_payload(&args).await?;
    let node = MemoryNode::new(args.name.clone());
    let dispatcher = Arc::new(HttpTransport::new(&config));
    let form = Form::new(node.clone(), dispatcher, &config).with_initial_fields(payload);

    form.events().on_start(|visit, node: &NodeRef| {
        info!(form = node.name(), method = %visit.method, url = %visit.url, "start");
    });
    form.events().on_progress(|progress, _node: &NodeRef| {
        if let Some(pct) = progress.and_then(|p| p.percentage()) {
            info!(progress = pct, "progress");
        }
    });
    form.events().on_error(|failure, _node: &NodeRef| {
        warn!(%failure, "error");
    });
    form.events().on_finish(|_visit, _node: &NodeRef| info!("finish"));

    let submission = form.submit(args.method, args.url.clone(), form.values());
    tokio::pin!(submission);
    let outcome = tokio::select! {
        outcome = &mut submission => outcome?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; cancelling submission");
            form.cancel();
            submission.await?
        }
    };

    match outcome {
        VisitOutcome::Vetoed => println!("submission vetoed"),
        VisitOutcome::Succeeded(page) => {
            println!("{}", page.status);
            if page.body != Value::Null {
                println!("{}", serde_json::to_string_pretty(&page.body)?);
            }
        }
        VisitOutcome::Failed(_) => print_node_errors(&node),
    }
    Ok(())
}

async fn validate(args: FormArgs, field: String, config: ClientConfig) -> Result<()> {
    let payload = read_payload(&args).await?;
    let transport = Arc::new(HttpTransport::new(&config));
    let form = PrecognitiveForm::new(
        args.method,
        args.url.clone(),
        MemoryNode::new(args.name.clone()),
        transport.clone(),
        transport,
        config,
    );

    let input = MemoryNode::new(field.clone());
    for (name, value) in payload.iter() {
        form.form().set_value(name.clone(), value.clone());
        if matches!(value, FieldValue::File(_)) && name != &field {
            form.register_input(MemoryNode::new(name.clone()), InputKind::File, Some("true"));
        }
    }
    let kind = match payload.get(&field) {
        Some(FieldValue::File(_)) => InputKind::File,
        _ => InputKind::Text,
    };
    form.register_input(input.clone(), kind, Some("true"));

    let mut validations = form.validations();
    match payload.get(&field) {
        Some(FieldValue::Json(value)) => form.commit(&field, value.clone())?,
        _ => form.debouncer().commit(&field, form.form().values())?,
    }
    info!(field = %field, "validation scheduled");

    let event = validations
        .recv()
        .await
        .context("validation channel closed")?;
    match event.result? {
        ValidationOutcome::Passed { status } => println!("{field}: ok ({status})"),
        ValidationOutcome::Failed(_) => print_node_errors(&input),
        ValidationOutcome::Superseded { latest } => {
            println!("{field}: superseded by request {latest}")
        }
    }
    Ok(())
}
