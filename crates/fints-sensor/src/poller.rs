//! Periodic sensor updates

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fints_client::run_blocking;
use futures::future::join_all;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::entity::SensorEntity;
use crate::state::{SensorState, StateStore, STATE_UNAVAILABLE};

type Registered = Arc<Vec<(String, Arc<dyn SensorEntity>)>>;

/// Updates a set of sensors now and then every `interval`
pub struct SensorPoller {
    entities: Registered,
    store: Arc<StateStore>,
    handle: JoinHandle<()>,
}

impl SensorPoller {
    /// Register the sensors in `store` and start polling
    ///
    /// The first update runs right away.
    pub fn start(
        entities: Vec<Arc<dyn SensorEntity>>,
        store: Arc<StateStore>,
        interval: Duration,
    ) -> Self {
        let entities: Registered = Arc::new(
            entities
                .into_iter()
                .map(|entity| (store.register(entity.name()), entity))
                .collect(),
        );

        let handle = {
            let entities = entities.clone();
            let store = store.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    update_all(&entities, &store).await;
                }
            })
        };

        debug!("Started polling {} sensors every {:?}", entities.len(), interval);
        Self {
            entities,
            store,
            handle,
        }
    }

    /// Entity ids of the polled sensors
    pub fn entity_ids(&self) -> Vec<String> {
        self.entities.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Update all sensors now, outside the schedule
    pub async fn refresh(&self) -> Vec<SensorState> {
        update_all(&self.entities, &self.store).await
    }

    /// Stop polling and remove the sensors' states
    pub fn stop(self) -> Vec<String> {
        self.handle.abort();
        let ids = self.entity_ids();
        for id in &ids {
            self.store.remove(id);
        }
        ids
    }
}

impl Drop for SensorPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn update_all(
    entities: &[(String, Arc<dyn SensorEntity>)],
    store: &StateStore,
) -> Vec<SensorState> {
    join_all(
        entities
            .iter()
            .map(|(entity_id, entity)| update_entity(entity_id, entity.clone(), store)),
    )
    .await
}

/// Run one sensor update on the blocking pool and store the result
pub async fn update_entity(
    entity_id: &str,
    entity: Arc<dyn SensorEntity>,
    store: &StateStore,
) -> SensorState {
    let mut attributes = HashMap::from([
        ("friendly_name".to_string(), json!(entity.name())),
        ("icon".to_string(), json!(entity.icon())),
    ]);

    let task = entity.clone();
    match run_blocking(move || task.update()).await {
        Ok(reading) => {
            attributes.extend(reading.attributes);
            attributes.insert(
                "unit_of_measurement".to_string(),
                json!(reading.unit_of_measurement),
            );
            store.set(entity_id, reading.native_value.to_string(), attributes)
        }
        Err(err) => {
            warn!("Updating {} failed: {}", entity.name(), err);
            store.set(entity_id, STATE_UNAVAILABLE, attributes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SensorReading;
    use fints_core::{BankError, BankResult};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSensor {
        name: String,
        updates: AtomicUsize,
        fail: bool,
    }

    impl CountingSensor {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                updates: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl SensorEntity for CountingSensor {
        fn name(&self) -> &str {
            &self.name
        }

        fn update(&self) -> BankResult<SensorReading> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BankError::Connection("down".to_string()));
            }
            Ok(SensorReading {
                native_value: dec!(42.10),
                unit_of_measurement: "EUR".to_string(),
                attributes: HashMap::from([("account".to_string(), json!("DE02"))]),
            })
        }
    }

    #[tokio::test]
    async fn test_update_entity_writes_state() {
        let store = StateStore::new();
        let sensor = CountingSensor::new("Giro", false);

        let state = update_entity("sensor.giro", sensor, &store).await;

        assert_eq!(state.state, "42.10");
        assert_eq!(state.attributes["friendly_name"], "Giro");
        assert_eq!(state.attributes["icon"], "mdi:currency-eur");
        assert_eq!(state.attributes["unit_of_measurement"], "EUR");
        assert_eq!(state.attributes["account"], "DE02");
        assert_eq!(store.get_state("sensor.giro").as_deref(), Some("42.10"));
    }

    #[tokio::test]
    async fn test_failed_update_is_unavailable() {
        let store = StateStore::new();
        let state = update_entity("sensor.giro", CountingSensor::new("Giro", true), &store).await;

        assert_eq!(state.state, STATE_UNAVAILABLE);
        assert!(!state.attributes.contains_key("unit_of_measurement"));
    }

    async fn wait_for_updates(sensor: &CountingSensor, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sensor.updates.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sensor was not updated");
    }

    #[tokio::test]
    async fn test_poller_updates_immediately_and_on_interval() {
        let store = Arc::new(StateStore::new());
        let sensor = CountingSensor::new("Giro", false);
        let poller = SensorPoller::start(
            vec![sensor.clone() as Arc<dyn SensorEntity>],
            store.clone(),
            Duration::from_millis(50),
        );
        assert_eq!(poller.entity_ids(), ["sensor.giro"]);

        wait_for_updates(&sensor, 1).await;
        wait_for_updates(&sensor, 2).await;

        let ids = poller.stop();
        assert_eq!(ids, ["sensor.giro"]);
        assert!(store.get("sensor.giro").is_none());
    }

    #[tokio::test]
    async fn test_refresh_updates_all() {
        let store = Arc::new(StateStore::new());
        let poller = SensorPoller::start(
            vec![
                CountingSensor::new("Giro", false) as Arc<dyn SensorEntity>,
                CountingSensor::new("Giro", true) as Arc<dyn SensorEntity>,
            ],
            store.clone(),
            Duration::from_secs(3600),
        );

        let states = poller.refresh().await;
        assert_eq!(states.len(), 2);
        assert_eq!(store.get_state("sensor.giro").as_deref(), Some("42.10"));
        assert_eq!(
            store.get_state("sensor.giro_2").as_deref(),
            Some(STATE_UNAVAILABLE)
        );
    }
}
