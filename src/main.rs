//! Gas price feed cache - keeps tomorrow's gas prices on hand
//!
//! A command-line host for the refresh cycle: runs it as a daemon on the
//! evening refresh windows, runs it once on demand, and reads or configures
//! the cached data.

use std::error::Error;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gasprices::cli::{parse_local_time, Cli, Command, WidgetCommand};
use gasprices::data::CityId;
use gasprices::refresh::{trigger_channel, RefreshConfig, RefreshCycle, RefreshHandle, RefreshMessage};
use gasprices::schedule::{next_refresh_time, RecordOnlyTimer, TokioTimer};
use gasprices::store::{PriceStore, RefreshMetadata};

/// Sets up log output on stderr, filtered by `RUST_LOG`
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "gasprices=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Formats an optional timestamp in local time
fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.with_timezone(&Local).to_rfc3339())
        .unwrap_or_else(|| "never".to_string())
}

/// Logs what each configured widget would now display
fn render_widgets(store: &PriceStore) {
    let view = store.view();
    for selection in view.widget_selections() {
        match view.city_record(selection.city_id) {
            Some(record) => info!(
                widget_id = selection.widget_id,
                city = %selection.city_name,
                "Widget updated: {}",
                record
            ),
            None => warn!(
                widget_id = selection.widget_id,
                city = %selection.city_name,
                "Widget city has no data in the current snapshot"
            ),
        }
    }
}

/// Refreshes now and at every refresh window until Ctrl-C
async fn run_daemon(config: &RefreshConfig) -> Result<(), Box<dyn Error>> {
    let store = Arc::new(config.open_store()?);
    let (trigger_tx, trigger_rx) = trigger_channel();
    let timer = TokioTimer::new(trigger_tx.clone());
    let cycle = Arc::new(RefreshCycle::new(
        Arc::clone(&store),
        config.fetcher()?,
        timer,
        config.gate(),
    ));

    let handle = RefreshHandle::spawn(cycle, trigger_tx, trigger_rx);

    // Redraw widgets once per finished cycle, whatever its outcome
    let mut events = handle.subscribe();
    let widget_store = Arc::clone(&store);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RefreshMessage::RefreshCompleted(_)) => render_widgets(&widget_store),
                Ok(RefreshMessage::RefreshStarted) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut changes = store.subscribe();
    let change_store = Arc::clone(&store);
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => info!(
                    cities = change_store.view().city_ids().len(),
                    "Gas price data changed"
                ),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(store = %store.dir().display(), "Starting refresh daemon");
    handle.request_refresh();
    handle
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

/// Runs a single cycle and prints its outcome
async fn refresh_once(config: &RefreshConfig) -> Result<(), Box<dyn Error>> {
    let store = Arc::new(config.open_store()?);
    let cycle = RefreshCycle::new(Arc::clone(&store), config.fetcher()?, RecordOnlyTimer, config.gate());

    let report = cycle.run().await?;
    match report.cities {
        Some(cities) => println!("Status: {} ({} cities)", report.status, cities),
        None => println!("Status: {}", report.status),
    }
    println!("Next refresh: {}", report.next_refresh.to_rfc3339());
    Ok(())
}

/// Prints refresh metadata followed by the snapshot or one city
fn show(config: &RefreshConfig, city: Option<CityId>) -> Result<(), Box<dyn Error>> {
    let store = config.open_store()?;
    let view = store.view();
    let RefreshMetadata {
        last_updated,
        next_refresh,
        last_attempt,
        last_status,
    } = view.metadata();

    println!("Last updated: {}", format_time(last_updated));
    println!("Next refresh: {}", format_time(next_refresh));
    match last_status {
        Some(status) => println!("Last attempt: {} ({})", format_time(last_attempt), status),
        None => println!("Last attempt: never"),
    }
    if let Some(selected) = view.selected_city() {
        println!("Selected city: {}", selected);
    }

    match city {
        Some(city_id) => match view.city_record(city_id) {
            Some(record) => println!("{}", record),
            None => println!("No data for city {}", city_id),
        },
        None => match view.raw_snapshot() {
            Some(raw) => println!("{}", raw),
            None => println!("No gas price data cached yet"),
        },
    }
    Ok(())
}

/// Applies a widget configuration command
fn widget(config: &RefreshConfig, command: &WidgetCommand) -> Result<(), Box<dyn Error>> {
    let store = config.open_store()?;
    match command {
        WidgetCommand::Set {
            widget_id,
            city_id,
            city_name,
        } => {
            store.set_widget_selection(*widget_id, *city_id, city_name.as_str())?;
            println!("Widget {} now shows {} (city {})", widget_id, city_name, city_id);
        }
        WidgetCommand::Clear { widget_ids } => {
            store.clear_widget_selections(widget_ids)?;
            println!("Cleared {} widget(s)", widget_ids.len());
        }
        WidgetCommand::List => {
            let view = store.view();
            let mut any = false;
            for selection in view.widget_selections() {
                any = true;
                println!(
                    "Widget {}: {} (city {})",
                    selection.widget_id, selection.city_name, selection.city_id
                );
            }
            if !any {
                println!("No widgets configured");
            }
        }
    }
    Ok(())
}

/// Dispatches the parsed command
async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = cli.refresh_config()?;

    match &cli.command {
        Command::Run => run_daemon(&config).await?,
        Command::Refresh => refresh_once(&config).await?,
        Command::Show { city } => show(&config, *city)?,
        Command::NextRefresh { at } => {
            let from = match at {
                Some(at) => parse_local_time(at)?,
                None => Local::now(),
            };
            println!("{}", next_refresh_time(&from).to_rfc3339());
        }
        Command::Widget(command) => widget(&config, command)?,
        Command::SelectCity { city_id } => {
            config.open_store()?.set_selected_city(*city_id)?;
            println!("Selected city {}", city_id);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
