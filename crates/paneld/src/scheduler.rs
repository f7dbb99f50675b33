//! Periodic background work.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::warn;

use crate::daemon::Context;
use crate::settings::keys;
use crate::watchdog;

pub const TELEMETRY_PERIOD: Duration = Duration::from_secs(5);
pub const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(1);
pub const LIVENESS_PERIOD: Duration = Duration::from_secs(30);

fn spawn_periodic<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        timer.tick().await;

        loop {
            timer.tick().await;
            tick().await;
        }
    })
}

async fn run_watchdog(ctx: Arc<Context>) {
    loop {
        let interval = ctx.settings.get_int(keys::WATCHDOG_INTERVAL).max(1) as u64;
        tokio::time::sleep(Duration::from_secs(interval)).await;

        if !ctx.settings.get_bool(keys::WATCHDOG_ENABLED) {
            continue;
        }

        let target = ctx.settings.get_string(keys::WATCHDOG_TARGET);
        if let Err(e) = watchdog::ensure_running(&ctx.proc_root, &target) {
            warn!("Watchdog check for {} failed: {}", target, e);
        }
    }
}

/// Owns the periodic tasks; [`Scheduler::cancel`] stops all of them
pub struct Scheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(ctx: &Arc<Context>) -> Self {
        let mut tasks = Vec::new();

        let c = Arc::clone(ctx);
        tasks.push(spawn_periodic(TELEMETRY_PERIOD, move || {
            let c = Arc::clone(&c);
            async move { c.session.publish_temp_and_hum().await }
        }));

        let c = Arc::clone(ctx);
        tasks.push(spawn_periodic(IDLE_CHECK_PERIOD, move || {
            let c = Arc::clone(&c);
            async move { c.actuation.idle_check().await }
        }));

        let c = Arc::clone(ctx);
        tasks.push(spawn_periodic(LIVENESS_PERIOD, move || {
            let c = Arc::clone(&c);
            async move { c.session.check_liveness() }
        }));

        tasks.push(tokio::spawn(run_watchdog(Arc::clone(ctx))));

        debug!("Scheduler started {} tasks", tasks.len());
        Self { tasks }
    }

    pub fn cancel(self) {
        for task in &self.tasks {
            task.abort();
        }
        debug!("Scheduler cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::DimState;
    use crate::daemon::test_context;

    #[tokio::test(start_paused = true)]
    async fn test_idle_task_dims_display() {
        let t = test_context("Stargate");
        t.ctx.settings.set(keys::SCREEN_SAVER_DELAY, 3i64).unwrap();
        let scheduler = Scheduler::start(&t.ctx);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(t.ctx.actuation.dim_state(), DimState::Awake);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(t.ctx.actuation.dim_state(), DimState::Dimmed);
        scheduler.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_every_five_seconds_until_cancelled() {
        let t = test_context("Stargate");
        let s = &t.ctx.settings;
        s.set(keys::MQTT_ENABLED, true).unwrap();
        s.set(keys::MQTT_BROKER, "broker.lan").unwrap();
        s.set(keys::MQTT_USERNAME, "user").unwrap();
        s.set(keys::MQTT_PASSWORD, "secret").unwrap();
        s.set(keys::SCREEN_SAVER_ENABLED, false).unwrap();
        t.ctx.session.check_config_and_connect().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let topic = t.ctx.session.topics().temperature();
        let initial = t.mqtt.log().published_to(&topic).len();

        let scheduler = Scheduler::start(&t.ctx);
        tokio::time::sleep(Duration::from_millis(15_500)).await;
        assert_eq!(t.mqtt.log().published_to(&topic).len(), initial + 3);

        scheduler.cancel();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(t.mqtt.log().published_to(&topic).len(), initial + 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_reconnects_dropped_session() {
        let t = test_context("Stargate");
        let s = &t.ctx.settings;
        s.set(keys::MQTT_ENABLED, true).unwrap();
        s.set(keys::MQTT_BROKER, "broker.lan").unwrap();
        s.set(keys::MQTT_USERNAME, "user").unwrap();
        s.set(keys::MQTT_PASSWORD, "secret").unwrap();
        t.mqtt.log().fail_connect = true;
        t.ctx.session.check_config_and_connect().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(t.mqtt.log().connects, 1);

        // Retry fires at 60s; liveness must not add attempts before that
        let scheduler = Scheduler::start(&t.ctx);
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(t.mqtt.log().connects, 1);

        t.mqtt.log().fail_connect = false;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(t.mqtt.log().connects, 2);
        scheduler.cancel();
    }
}
