//! HDPay server entrypoint.
//!
//! Startup order: `.env` → tracing → config (mnemonic validated) → store
//! (migrations) → idempotent address derivation → provider pools → sweep
//! engines → reconciler → poller → two HTTP listeners (main API on
//! localhost, poller on its own port). Shutdown cancels every scan, sweep,
//! and watch context, waits for background tasks to drain, then closes the
//! store; in-flight tx-state is left for the next boot's reconciler.
//!
//! Exit codes: 0 on graceful shutdown, 2 on invalid configuration or tier
//! file, 3 on database open failure, 1 on listener errors.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use dotenvy::dotenv;

use hdpay::chain::Chain;
use hdpay::config::Config;
use hdpay::derive::Wallet;
use hdpay::engine::bsc::BscEngine;
use hdpay::engine::btc::BtcEngine;
use hdpay::engine::reconciler::Reconciler;
use hdpay::engine::sol::SolEngine;
use hdpay::engine::SweepEngine;
use hdpay::events::EventHub;
use hdpay::http::{AppState, router};
use hdpay::poller::auth::AdminAuth;
use hdpay::poller::http::{PollerState, router as poller_router};
use hdpay::poller::price::PriceService;
use hdpay::poller::tiers::TierSchedule;
use hdpay::poller::watcher::Watcher;
use hdpay::providers::bsc::{BscRpcProvider, BscScanProvider};
use hdpay::providers::btc::EsploraProvider;
use hdpay::providers::sol::SolRpcProvider;
use hdpay::providers::{ProviderPool, ScanBackend};
use hdpay::scanner::Scanner;
use hdpay::sig_down::SigDown;
use hdpay::store::Store;
use hdpay::telemetry;

#[tokio::main]
async fn main() {
    dotenv().ok();
    telemetry::init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    let tiers = match TierSchedule::load(&config.tiers_file) {
        Ok(tiers) => tiers,
        Err(e) => {
            tracing::error!(error = %e, "tier configuration rejected");
            std::process::exit(2);
        }
    };

    let store = match Store::open(&config.db_path, config.network).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, db = %config.db_path.display(), "failed to open database");
            std::process::exit(3);
        }
    };

    if let Err(code) = run(config, tiers, store.clone()).await {
        store.close().await;
        std::process::exit(code);
    }
    store.close().await;
    tracing::info!("goodbye");
}

async fn run(config: Config, tiers: TierSchedule, store: Store) -> Result<(), i32> {
    let network = config.network;
    let wallet = Wallet::new(config.mnemonic_file.clone(), network);

    init_addresses(&store, &wallet, config.address_count).await?;

    let sig_down = match SigDown::try_new() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to register signal handlers");
            return Err(1);
        }
    };
    let shutdown = sig_down.cancellation_token();
    let tracker = sig_down.tracker().clone();

    // Provider pools, one per chain plus the poller's BscScan set.
    let btc_pool = Arc::new(ProviderPool::new(
        Chain::Btc,
        EsploraProvider::defaults(network),
        Some(store.clone()),
    ));
    let bsc_pool = Arc::new(ProviderPool::new(
        Chain::Bsc,
        BscRpcProvider::defaults(network, config.bsc_rpc_url.as_deref()),
        Some(store.clone()),
    ));
    let sol_pool = Arc::new(ProviderPool::new(
        Chain::Sol,
        SolRpcProvider::defaults(network, config.sol_rpc_url.as_deref()),
        Some(store.clone()),
    ));
    let bscscan_pool = Arc::new(ProviderPool::new(
        Chain::Bsc,
        vec![BscScanProvider::new(network, config.bscscan_api_key.clone())],
        Some(store.clone()),
    ));

    let scan_hub = EventHub::new("scan");
    let tx_hub = EventHub::new("tx");

    let backends: Vec<Arc<dyn ScanBackend>> = vec![
        Arc::clone(&btc_pool) as Arc<dyn ScanBackend>,
        Arc::clone(&bsc_pool) as Arc<dyn ScanBackend>,
        Arc::clone(&sol_pool) as Arc<dyn ScanBackend>,
    ];
    let scanner = Scanner::new(
        store.clone(),
        backends.clone(),
        Arc::clone(&scan_hub),
        tracker.clone(),
        shutdown.clone(),
    );

    let btc_engine = BtcEngine::new(
        store.clone(),
        wallet.clone(),
        Arc::clone(&btc_pool),
        Arc::clone(&tx_hub),
        tracker.clone(),
    );
    let bsc_engine = BscEngine::new(
        store.clone(),
        wallet.clone(),
        Arc::clone(&bsc_pool),
        Arc::clone(&tx_hub),
        tracker.clone(),
    );
    let sol_engine = SolEngine::new(
        store.clone(),
        wallet.clone(),
        Arc::clone(&sol_pool),
        Arc::clone(&tx_hub),
        tracker.clone(),
    );
    let mut engines: HashMap<Chain, Arc<dyn SweepEngine>> = HashMap::new();
    engines.insert(Chain::Btc, Arc::clone(&btc_engine) as Arc<dyn SweepEngine>);
    engines.insert(Chain::Bsc, Arc::clone(&bsc_engine) as Arc<dyn SweepEngine>);
    engines.insert(Chain::Sol, Arc::clone(&sol_engine) as Arc<dyn SweepEngine>);

    // Reconcile whatever the previous process left in flight.
    let reconciler = Reconciler::new(
        store.clone(),
        Arc::clone(&btc_pool),
        Arc::clone(&bsc_pool),
        Arc::clone(&sol_pool),
        tracker.clone(),
    );
    if let Err(e) = reconciler.run().await {
        tracing::error!(error = %e, "reconciliation failed; continuing startup");
    }

    // Poller.
    let price = Arc::new(PriceService::new());
    let watcher = Watcher::new(
        store.clone(),
        tiers,
        Arc::clone(&price),
        Arc::clone(&btc_pool),
        Arc::clone(&bscscan_pool),
        Arc::clone(&sol_pool),
        network,
        config.poller_start_date,
        tracker.clone(),
        shutdown.clone(),
    );
    if let Err(e) = watcher.resume_active().await {
        tracing::error!(error = %e, "failed to resume watches");
    }

    let app_state = AppState {
        store: store.clone(),
        network,
        scanner,
        engines: Arc::new(engines),
        bsc_engine,
        backends: Arc::new(backends),
        scan_hub,
        tx_hub,
    };
    let poller_state = PollerState {
        store: store.clone(),
        watcher,
        auth: Arc::new(AdminAuth::new(
            config.poller_admin_user.clone(),
            config.poller_admin_password_hash.clone(),
        )),
        allowlist: Arc::new(config.poller_ip_allowlist.clone()),
    };

    // The main API answers localhost only; the poller binds wide and gates
    // by source IP.
    let api_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.port);
    let poller_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.poller_port);

    let api_listener = match tokio::net::TcpListener::bind(api_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %api_addr, error = %e, "failed to bind main API");
            return Err(1);
        }
    };
    let poller_listener = match tokio::net::TcpListener::bind(poller_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %poller_addr, error = %e, "failed to bind poller API");
            return Err(1);
        }
    };
    tracing::info!(api = %api_addr, poller = %poller_addr, network = %network, "hdpay is up");

    let api_shutdown = shutdown.clone();
    let api_server = axum::serve(api_listener, router(app_state))
        .with_graceful_shutdown(async move { api_shutdown.cancelled().await });
    let poller_shutdown = shutdown.clone();
    let poller_server = axum::serve(
        poller_listener,
        poller_router(poller_state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { poller_shutdown.cancelled().await });

    let (api_result, poller_result) = tokio::join!(api_server, poller_server);
    for result in [api_result, poller_result] {
        if let Err(e) = result {
            tracing::error!(error = %e, "http server error");
            return Err(1);
        }
    }

    // Listeners are down; wait for scans, sweeps, and watches to drain.
    sig_down.drain().await;
    Ok(())
}

/// Derives any missing addresses up to the configured cohort size. Running
/// twice with the same mnemonic is a no-op.
async fn init_addresses(store: &Store, wallet: &Wallet, count: u32) -> Result<(), i32> {
    for chain in Chain::ALL {
        let existing = match store.address_count(chain).await {
            Ok(n) => n as u32,
            Err(e) => {
                tracing::error!(error = %e, "failed to count addresses");
                return Err(3);
            }
        };
        if existing >= count {
            continue;
        }
        let wallet = wallet.clone();
        let derived = tokio::task::spawn_blocking(move || {
            let mut rows = Vec::with_capacity((count - existing) as usize);
            for index in existing..count {
                match wallet.address(chain, index) {
                    Ok(address) => rows.push((index, address)),
                    Err(e) => return Err(e),
                }
            }
            Ok(rows)
        })
        .await;
        let rows = match derived {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                tracing::error!(chain = %chain, error = %e, "address derivation failed");
                return Err(2);
            }
            Err(e) => {
                tracing::error!(error = %e, "derivation task panicked");
                return Err(2);
            }
        };
        match store.insert_addresses(chain, &rows).await {
            Ok(inserted) => {
                tracing::info!(chain = %chain, inserted, cohort = count, "addresses derived");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to persist addresses");
                return Err(3);
            }
        }
    }
    Ok(())
}
