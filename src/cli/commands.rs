//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;

use super::args::{AnalyzeArgs, Cli, Commands, ConfigArgs, RecordArgs};
use crate::analysis::{HttpClassifier, RecordStatus};
use crate::audio::CpalSource;
use crate::coordinator::{self, CoordinatorConfig, CoordinatorHandle};
use crate::playback::DetachedPlayer;
use crate::settings::{load_settings, save_settings, settings_path, Settings};
use crate::store::{JsonRecordStore, RecordStore};
use crate::view::{format_duration, RecorderView, ViewState};

/// How long to wait for the recorder to finalize after stopping.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn run_cli(cli: Cli) -> Result<()> {
    let config_path = settings_path()
        .map_err(|e| log::warn!("Settings: {}", e))
        .ok();
    let mut settings = config_path
        .as_deref()
        .map(load_settings)
        .unwrap_or_default()
        .with_env_overrides();
    if let Some(server) = cli.server {
        settings.server_url = server;
    }
    let store_path = cli.store.unwrap_or_else(JsonRecordStore::default_path);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Record(args) => record(&settings, &store_path, args).await,
            Commands::List => list(&store_path),
            Commands::Analyze(args) => analyze(&settings, &store_path, args).await,
            Commands::Delete { id } => delete(&settings, &store_path, id).await,
            Commands::Config(args) => config(args, &settings, config_path.as_deref(), &store_path),
        }
    })
}

fn start_coordinator(settings: &Settings, store_path: &Path) -> Result<CoordinatorHandle> {
    let store = JsonRecordStore::open(store_path)
        .with_context(|| format!("Failed to open record store {:?}", store_path))?;
    let classifier = HttpClassifier::new(&settings.server_url)
        .context("Failed to create classifier client")?;

    Ok(coordinator::spawn(
        CoordinatorConfig::from(settings),
        Arc::new(CpalSource::new()),
        Arc::new(classifier),
        Arc::new(store),
        Arc::new(DetachedPlayer::new()),
    ))
}

async fn record(settings: &Settings, store_path: &Path, args: RecordArgs) -> Result<()> {
    let handle = start_coordinator(settings, store_path)?;
    handle.permission_granted().await?;

    let wav_path = handle
        .start_recording()
        .await
        .context("Could not start recording")?;
    println!("Recording for {} s...", args.seconds);

    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    handle.stop_recording().await?;

    let mut view = handle.subscribe();
    let finished = wait_for_recorder(&mut view).await?;

    let result = match finished {
        RecorderView::Recorded {
            wav_path: recorded,
            duration,
            suggested_name,
        } => {
            let name = args.name.unwrap_or(suggested_name);
            let id = handle
                .save_recording(name.clone(), recorded.clone(), Some(duration))
                .await?;
            println!(
                "Saved #{} \"{}\" ({}) -> {}",
                id,
                name,
                format_duration(duration),
                recorded.display()
            );
            Ok(())
        }
        RecorderView::Error { message } => Err(anyhow::anyhow!(message)),
        other => Err(anyhow::anyhow!(
            "Recording {:?} ended in unexpected state {:?}",
            wav_path,
            other
        )),
    };

    handle.shutdown().await?;
    result
}

async fn wait_for_recorder(view: &mut watch::Receiver<ViewState>) -> Result<RecorderView> {
    let state = tokio::time::timeout(
        FINALIZE_TIMEOUT,
        view.wait_for(|v| {
            matches!(
                v.recorder,
                RecorderView::Recorded { .. } | RecorderView::Error { .. }
            )
        }),
    )
    .await
    .context("Timed out waiting for the recording to finalize")?
    .context("Coordinator stopped")?;
    Ok(state.recorder.clone())
}

fn list(store_path: &Path) -> Result<()> {
    let store = JsonRecordStore::open(store_path)
        .with_context(|| format!("Failed to open record store {:?}", store_path))?;
    let records = store.observe_all().borrow().clone();

    if records.is_empty() {
        println!("No recordings yet. Use `pathology-detector record` to make one.");
        return Ok(());
    }

    for record in records {
        println!(
            "#{:<4} {}  {}  {:<24} {}",
            record.id,
            record
                .created_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S"),
            format_duration(Duration::from_millis(record.duration_ms)),
            record.file_name,
            RecordStatus::overlay(&record.status, None)
        );
    }
    Ok(())
}

async fn analyze(settings: &Settings, store_path: &Path, args: AnalyzeArgs) -> Result<()> {
    let handle = start_coordinator(settings, store_path)?;
    let model = args.model.unwrap_or(settings.default_model);

    let started = handle.request_analysis(args.id, model).await?;
    if !started {
        let status = handle
            .view()
            .record(args.id)
            .map(|r| r.status.to_string())
            .unwrap_or_default();
        println!("Record #{} was not submitted: {}", args.id, status);
        handle.shutdown().await?;
        return Ok(());
    }

    println!(
        "Submitted #{} to {} with {} (retrying until the server answers)...",
        args.id, settings.server_url, model
    );

    let mut view = handle.subscribe();
    let finished = view
        .wait_for(|v| {
            v.record(args.id)
                .map(|r| !r.status.is_processing())
                .unwrap_or(true)
        })
        .await
        .context("Coordinator stopped")?
        .clone();

    let status = finished
        .record(args.id)
        .map(|r| r.status.clone())
        .unwrap_or(RecordStatus::NotProcessed);
    handle.shutdown().await?;

    if let Some(notice) = finished.notice {
        bail!("{}", notice);
    }
    println!("#{}: {}", args.id, status);
    Ok(())
}

async fn delete(settings: &Settings, store_path: &Path, id: i64) -> Result<()> {
    let handle = start_coordinator(settings, store_path)?;
    let result = handle.delete_record(id).await;
    handle.shutdown().await?;
    result?;
    println!("Deleted #{}", id);
    Ok(())
}

fn config(
    args: ConfigArgs,
    settings: &Settings,
    config_path: Option<&Path>,
    store_path: &Path,
) -> Result<()> {
    if args.set.is_empty() {
        return show_config(settings, config_path, store_path);
    }
    let path = config_path.context("No settings file location on this platform")?;
    persist_overrides(path, &args.set)?;
    println!("Saved {}", path.display());
    Ok(())
}

/// Apply `KEY=VALUE` pairs to the settings file and save it. Environment and
/// command-line overrides are not written back.
pub(crate) fn persist_overrides(path: &Path, pairs: &[String]) -> Result<Settings> {
    let mut settings = load_settings(path);
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got '{}'", pair))?;
        settings.set(key.trim(), value).map_err(anyhow::Error::msg)?;
    }
    save_settings(path, &settings).map_err(anyhow::Error::msg)?;
    log::info!("Settings saved to {:?}", path);
    Ok(settings)
}

fn show_config(settings: &Settings, config_path: Option<&Path>, store_path: &Path) -> Result<()> {
    let config_display = config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<unavailable>".to_string());
    let recordings: PathBuf = settings.recordings_dir();

    println!("Settings file:  {}", config_display);
    println!("Record store:   {}", store_path.display());
    println!("Recordings dir: {}", recordings.display());
    println!(
        "{}",
        serde_json::to_string_pretty(settings).context("Failed to serialize settings")?
    );
    Ok(())
}
