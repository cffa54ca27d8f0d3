use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use clap_serde_derive::ClapSerde;
use hf_hub::api::sync::Api;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::annotate::RuntimeParams;
use crate::config::Config;
use crate::error::{HttpErrorResponse, WrapperError, WrapperResult};
use crate::inference::whisper::{ModelSize, WhisperModel};
use crate::metadata::{app_identifier, app_metadata, AppMetadata};
use crate::mmif::{Mmif, View};

mod annotate;
mod config;
mod error;
mod inference;
mod metadata;
mod mmif;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = "WhisperWrapper.toml")]
    config_file: String,

    /// Run with production log defaults
    #[arg(long)]
    production: bool,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

pub(crate) struct AppState {
    config: Config,
    default_size: ModelSize,
    api: Api,
    models: RwLock<HashMap<ModelSize, WhisperModel>>,
}

impl AppState {
    pub(crate) fn default_size(&self) -> ModelSize {
        self.default_size
    }

    /// Cloned handle to the model for the given size, loading and caching it
    /// on first use. The default size is always present after startup.
    pub(crate) fn model(&self, size: ModelSize) -> Result<WhisperModel> {
        if let Some(model) = self
            .models
            .read()
            .expect("model registry poisoned")
            .get(&size)
        {
            return Ok(model.clone());
        }
        info!("whisper {size} model not cached, loading now");
        let model = WhisperModel::new(&self.api, size, &self.config)?;
        self.models
            .write()
            .expect("model registry poisoned")
            .insert(size, model.clone());
        Ok(model)
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.production { "info" } else { "debug" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == "WhisperWrapper.toml" {
                Config::default().merge(args.opt_config)
            } else {
                exit_err!(
                    1,
                    "Failed to read configuration file {} with error: {}",
                    args.config_file,
                    err
                );
            }
        }
    };

    let default_size = match config.model_size.parse::<ModelSize>() {
        Ok(size) => size,
        Err(err) => exit_err!(1, "Invalid model_size in configuration: {}", err),
    };
    let api = match Api::new() {
        Ok(api) => api,
        Err(err) => exit_err!(1, "Failed to create hub API: {}", err),
    };

    // Model load failure is fatal here, not per request.
    info!("loading whisper {default_size} model");
    let model = match WhisperModel::new(&api, default_size, &config) {
        Ok(model) => model,
        Err(err) => exit_err!(1, "Failed to load whisper {} model: {}", default_size, err),
    };
    let mut models = HashMap::new();
    models.insert(default_size, model);

    let address = format!("{}:{}", config.address, config.port);
    let state = Arc::new(AppState {
        config,
        default_size,
        api,
        models: RwLock::new(models),
    });

    let router = Router::new()
        .route("/", get(handle_metadata).post(handle_annotate))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(address).await?;
    info!("Listening on {}", listener.local_addr()?);
    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[axum_macros::debug_handler]
async fn handle_metadata() -> Json<AppMetadata> {
    Json(app_metadata())
}

#[axum_macros::debug_handler(state = Arc<AppState>)]
async fn handle_annotate(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RuntimeParams>,
    body: String,
) -> WrapperResult<Response> {
    let mut mmif: Mmif = match serde_json::from_str(&body) {
        Ok(mmif) => mmif,
        Err(err) => bail_wrapper!(
            StatusCode::BAD_REQUEST,
            "Invalid MMIF in request body: {}",
            err
        ),
    };
    let pretty = params.pretty.unwrap_or(false);

    match annotate::annotate(&state, &mut mmif, &params) {
        Ok(()) => mmif_response(StatusCode::OK, &mmif, pretty),
        Err(failure) => {
            warn!("annotation failed: {}", failure.message);
            let view = View::with_error(
                mmif.new_view_id(),
                app_identifier(),
                params.as_map(),
                failure.message,
            );
            mmif.views.push(view);
            mmif_response(failure.status, &mmif, pretty)
        }
    }
}

fn mmif_response(status: StatusCode, mmif: &Mmif, pretty: bool) -> WrapperResult<Response> {
    let body = if pretty {
        serde_json::to_string_pretty(mmif)?
    } else {
        serde_json::to_string(mmif)?
    };
    let mut res = ([(header::CONTENT_TYPE, "application/json")], body).into_response();
    *res.status_mut() = status;
    Ok(res)
}

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}
