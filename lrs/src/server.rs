//! Server wiring: listeners, shared collaborators, lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::net::TcpListener;

use hub::Hub;
use shared::config::{CircuitBreaker, NeverCritical, SharedConfig};
use shared::hooks::{Blackhole, SharedHooks, SharedStats};
use shared::time::{Clock, MonotonicClock};

use crate::interrupt::Interrupt;
use crate::rtc_endpoint::RtcEndpoint;
use crate::rtmp_session;
use crate::srt2rtmp::{self, Srt2RtmpHandle};
use crate::ticker::Tickers;

pub struct Server {
    pub hub: Arc<Hub>,
    pub config: SharedConfig,
    pub hooks: SharedHooks,
    pub stats: SharedStats,
    pub clock: Arc<dyn Clock>,
    pub breaker: Arc<dyn CircuitBreaker>,
    interrupt: Interrupt,
    next_context_id: AtomicU64,
}

impl Server {
    pub fn new(config: SharedConfig, hooks: SharedHooks) -> Arc<Self> {
        Arc::new(Self {
            hub: Arc::new(Hub::default()),
            config,
            hooks,
            stats: Arc::new(Blackhole::default()),
            clock: Arc::new(MonotonicClock::default()),
            breaker: Arc::new(NeverCritical),
            interrupt: Interrupt::new(),
            next_context_id: AtomicU64::new(1),
        })
    }

    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Brings up the RTMP listener, the RTC endpoint and the srt2rtmp
    /// bridge, then serves until interrupted.
    pub async fn serve(self: Arc<Self>) -> shared::error::Result<()> {
        let tickers = Arc::new(Tickers::start(self.clock.clone()));

        let rtc = RtcEndpoint::bind(
            self.config.rtc_listen_port(),
            Arc::clone(&self.hub),
            self.config.clone(),
            self.hooks.clone(),
            self.clock.clone(),
            self.breaker.clone(),
            Arc::clone(&tickers),
        )
        .await?;
        tokio::spawn(Arc::clone(&rtc).run(self.interrupt.clone()));

        let _srt: Srt2RtmpHandle = srt2rtmp::start(
            self.config.clone(),
            self.config.listen_rtmp_port(),
            self.interrupt.clone(),
        );

        let rtmp_port = self.config.listen_rtmp_port();
        let listener = TcpListener::bind(("0.0.0.0", rtmp_port)).await?;
        info!("rtmp: listening on tcp {rtmp_port}");

        // 1 s housekeeping: reap expired sources.
        {
            let hub = Arc::clone(&self.hub);
            let stats = self.stats.clone();
            let mut tick = tickers.tick_1s.subscribe();
            let interrupt = self.interrupt.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        t = tick.recv() => match t {
                            Ok(_) => {
                                let reaped = hub.sweep(std::time::Instant::now());
                                stats.incr("hub.sources_reaped", reaped as u64);
                                stats.gauge("hub.sources", hub.len() as i64);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        },
                        _ = interrupt.stopped() => return,
                    }
                }
            });
        }

        loop {
            let (stream, peer) = tokio::select! {
                r = listener.accept() => r?,
                _ = self.interrupt.stopped() => {
                    rtc.stop_all();
                    return Ok(());
                }
            };
            let context_id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
            self.stats.incr("rtmp.accepted", 1);
            info!("rtmp: accepted {peer} as context {context_id}");
            let hub = Arc::clone(&self.hub);
            let config = self.config.clone();
            let hooks = self.hooks.clone();
            let interrupt = self.interrupt.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    rtmp_session::run(stream, hub, config, hooks, interrupt, context_id).await
                {
                    warn!("rtmp: session {context_id} ended: {e}");
                }
            });
        }
    }
}
