//! Read-only view of a skeleton's store on a message bus
//!
//! The skeleton owning a service's store claims `io.trustd.Store.<service>`
//! and serves `io.trustd.Store1` at `/io/trustd/Store`. Owning the name is
//! what makes it the only writer of that store.

use std::sync::Arc;
use tracing::info;
use zbus::{fdo, interface, proxy, Connection};

use super::{parse_answer, parse_timestamp, Store, Verdict};
use crate::bus;
use crate::config::{store_bus_name, BusScope};
use crate::error::StoreError;
use crate::request::Answer;

pub const STORE_PATH: &str = "/io/trustd/Store";

/// Lookup token for a feature that was never decided
pub const UNKNOWN: &str = "unknown";

/// (uid, feature, answer, decided_at)
type WireVerdict = (u32, u64, String, String);

struct StoreObject {
    service: String,
    store: Arc<dyn Store>,
}

#[interface(name = "io.trustd.Store1")]
impl StoreObject {
    async fn lookup(&self, uid: u32, feature: u64) -> fdo::Result<String> {
        match self.store.lookup(&self.service, uid, feature) {
            Ok(Some(answer)) => Ok(answer.to_string()),
            Ok(None) => Ok(UNKNOWN.to_string()),
            Err(e) => Err(fdo::Error::Failed(e.to_string())),
        }
    }

    async fn list(&self) -> fdo::Result<Vec<WireVerdict>> {
        let records = self
            .store
            .records(&self.service)
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;

        Ok(records
            .into_iter()
            .map(|v| (v.uid, v.feature, v.answer.to_string(), v.decided_at.to_rfc3339()))
            .collect())
    }

    #[zbus(property)]
    async fn service(&self) -> String {
        self.service.clone()
    }
}

/// Expose `store` on the bus selected by `scope`. The returned connection
/// keeps the name owned until it is dropped.
pub async fn expose(scope: BusScope, service: &str, store: Arc<dyn Store>) -> Result<Connection, StoreError> {
    let connection = bus::connect(scope)
        .await
        .map_err(|e| StoreError::Unreachable(format!("{} bus: {}", scope, e)))?;

    connection
        .object_server()
        .at(
            STORE_PATH,
            StoreObject {
                service: service.to_string(),
                store,
            },
        )
        .await?;

    let name = store_bus_name(service);
    bus::claim_name(&connection, &name).await?;
    info!("Trust store of {} exposed as {} on the {} bus", service, name, scope);

    Ok(connection)
}

#[proxy(
    interface = "io.trustd.Store1",
    default_path = "/io/trustd/Store",
    gen_blocking = false
)]
trait Store1 {
    fn lookup(&self, uid: u32, feature: u64) -> zbus::Result<String>;

    fn list(&self) -> zbus::Result<Vec<(u32, u64, String, String)>>;
}

/// Client side of an exposed store
pub struct StoreClient {
    proxy: Store1Proxy<'static>,
}

impl StoreClient {
    pub async fn connect(scope: BusScope, service: &str) -> Result<Self, StoreError> {
        let connection = bus::connect(scope)
            .await
            .map_err(|e| StoreError::Unreachable(format!("{} bus: {}", scope, e)))?;

        let proxy = Store1Proxy::builder(&connection)
            .destination(store_bus_name(service))?
            .build()
            .await?;

        Ok(Self { proxy })
    }

    pub async fn lookup(&self, uid: u32, feature: u64) -> Result<Option<Answer>, StoreError> {
        let token = self.proxy.lookup(uid, feature).await?;
        if token == UNKNOWN {
            return Ok(None);
        }
        parse_answer(&token).map(Some)
    }

    pub async fn records(&self) -> Result<Vec<Verdict>, StoreError> {
        self.proxy
            .list()
            .await?
            .into_iter()
            .map(|(uid, feature, answer, decided_at)| {
                Ok(Verdict {
                    uid,
                    feature,
                    answer: parse_answer(&answer)?,
                    decided_at: parse_timestamp(&decided_at)?,
                })
            })
            .collect()
    }
}
