//! Bus binding: frames carried as method calls on a message bus
//!
//! The listening side owns a well-known name and serves a mailbox object.
//! A connecting side serves its own mailbox on its unique name, then calls
//! `Attach` on the listener. From then on each frame is one `Deliver` call
//! to the peer's mailbox, and `Detach` tears the channel down. Every mailbox
//! only accepts frames from the peer it is paired with. A peer that leaves
//! the bus without detaching closes the channel as well.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use zbus::fdo::{self, DBusProxy};
use zbus::message::Header;
use zbus::names::{BusName, UniqueName};
use zbus::{interface, Connection};

use crate::bus;
use crate::config::BusScope;
use crate::error::ChannelError;

pub const CHANNEL_PATH: &str = "/io/trustd/Channel";
pub const CHANNEL_INTERFACE: &str = "io.trustd.Channel1";

type Inbox = mpsc::UnboundedSender<String>;
type SharedInbox = Arc<Mutex<Option<Inbox>>>;
type PeerTable = Arc<Mutex<HashMap<String, Inbox>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connecting peer that announced itself to the listener
struct Attached {
    peer: String,
    uid: Option<u32>,
    inbox: mpsc::UnboundedReceiver<String>,
    departure: JoinHandle<()>,
}

enum Role {
    Listener {
        peers: PeerTable,
        attached: mpsc::UnboundedSender<Attached>,
    },
    Connector {
        listener: String,
        inbox: SharedInbox,
    },
}

struct Mailbox {
    role: Role,
}

fn sender_of(header: &Header<'_>) -> fdo::Result<UniqueName<'static>> {
    header
        .sender()
        .map(|sender| sender.to_owned())
        .ok_or_else(|| fdo::Error::AccessDenied("anonymous sender".to_string()))
}

#[interface(name = "io.trustd.Channel1")]
impl Mailbox {
    async fn attach(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        let Role::Listener { peers, attached } = &self.role else {
            return Err(fdo::Error::NotSupported("not a listening endpoint".to_string()));
        };

        let sender = sender_of(&header)?;
        let uid = DBusProxy::new(connection)
            .await?
            .get_connection_unix_user(BusName::Unique(sender.clone()))
            .await
            .ok();

        let (tx, rx) = mpsc::unbounded_channel();
        lock(peers).insert(sender.to_string(), tx);

        let watched = {
            let peers = Arc::clone(peers);
            let key = sender.to_string();
            watch_departure(connection, sender.clone(), move || {
                lock(&peers).remove(&key);
            })
            .await
        };
        let departure = match watched {
            Ok(departure) => departure,
            Err(e) => {
                lock(peers).remove(sender.as_str());
                return Err(fdo::Error::Failed(format!("cannot watch {}: {}", sender, e)));
            }
        };

        debug!("Peer {} attached (uid {:?})", sender, uid);

        attached
            .send(Attached {
                peer: sender.to_string(),
                uid,
                inbox: rx,
                departure,
            })
            .map_err(|_| fdo::Error::Failed("listener is shutting down".to_string()))
    }

    async fn deliver(&self, #[zbus(header)] header: Header<'_>, frame: String) -> fdo::Result<()> {
        let sender = sender_of(&header)?;

        let inbox = match &self.role {
            Role::Listener { peers, .. } => lock(peers).get(sender.as_str()).cloned(),
            Role::Connector { listener, inbox } => {
                if sender.as_str() != listener {
                    return Err(fdo::Error::AccessDenied(format!("{} is not our peer", sender)));
                }
                lock(inbox).clone()
            }
        };

        match inbox {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(fdo::Error::Failed("channel is not attached".to_string())),
        }
    }

    async fn detach(&self, #[zbus(header)] header: Header<'_>) -> fdo::Result<()> {
        let sender = sender_of(&header)?;

        match &self.role {
            Role::Listener { peers, .. } => {
                lock(peers).remove(sender.as_str());
            }
            Role::Connector { listener, inbox } => {
                if sender.as_str() == listener {
                    lock(inbox).take();
                }
            }
        }

        debug!("Peer {} detached", sender);
        Ok(())
    }
}

/// One end of a bus channel
pub struct BusChannel {
    connection: Connection,
    /// Where our frames go: a unique name (listener side) or the
    /// listener's well-known name (connector side)
    peer: String,
    inbox: mpsc::UnboundedReceiver<String>,
    peer_uid: Option<u32>,
    peers: Option<PeerTable>,
    max_frame_bytes: usize,
    /// Closes the inbox when the peer leaves the bus
    departure: JoinHandle<()>,
}

impl BusChannel {
    /// Attach to a listener that owns `name` on the bus selected by `scope`
    pub async fn connect(scope: BusScope, name: &str, max_frame_bytes: usize) -> Result<Self, ChannelError> {
        let connection = bus::connect(scope).await?;

        let dbus = DBusProxy::new(&connection).await?;
        let owner = dbus
            .get_name_owner(BusName::try_from(name).map_err(zbus::Error::from)?)
            .await
            .map_err(zbus::Error::from)?;
        let peer_uid = dbus
            .get_connection_unix_user(BusName::Unique(owner.inner().clone()))
            .await
            .ok();

        let (tx, rx) = mpsc::unbounded_channel();
        let inbox: SharedInbox = Arc::new(Mutex::new(Some(tx)));
        connection
            .object_server()
            .at(
                CHANNEL_PATH,
                Mailbox {
                    role: Role::Connector {
                        listener: owner.to_string(),
                        inbox: Arc::clone(&inbox),
                    },
                },
            )
            .await?;

        let departure = watch_departure(&connection, owner.inner().clone(), move || {
            lock(&inbox).take();
        })
        .await?;

        connection
            .call_method(Some(name), CHANNEL_PATH, Some(CHANNEL_INTERFACE), "Attach", &())
            .await
            .map_err(call_error)?;

        Ok(Self {
            connection,
            peer: name.to_string(),
            inbox: rx,
            peer_uid,
            peers: None,
            max_frame_bytes,
            departure,
        })
    }

    pub async fn send(&mut self, frame: &str) -> Result<(), ChannelError> {
        if frame.len() > self.max_frame_bytes {
            return Err(ChannelError::Malformed("frame exceeds maximum length".to_string()));
        }

        self.connection
            .call_method(
                Some(self.peer.as_str()),
                CHANNEL_PATH,
                Some(CHANNEL_INTERFACE),
                "Deliver",
                &(frame,),
            )
            .await
            .map(|_| ())
            .map_err(call_error)
    }

    /// Next frame. Cancel-safe.
    pub async fn receive(&mut self) -> Result<String, ChannelError> {
        let frame = self.inbox.recv().await.ok_or(ChannelError::Closed)?;
        if frame.len() > self.max_frame_bytes {
            return Err(ChannelError::Malformed("frame exceeds maximum length".to_string()));
        }
        Ok(frame)
    }

    pub fn peer_uid(&self) -> Option<u32> {
        self.peer_uid
    }

    /// Tell the peer we are going away
    pub async fn close(self) {
        if let Some(peers) = &self.peers {
            lock(peers).remove(&self.peer);
        }

        let _ = self
            .connection
            .call_method(Some(self.peer.as_str()), CHANNEL_PATH, Some(CHANNEL_INTERFACE), "Detach", &())
            .await;
    }
}

impl Drop for BusChannel {
    fn drop(&mut self) {
        self.departure.abort();
    }
}

/// Run `gone` once `peer` has left the bus. Unique names are never reused,
/// so any ownership change of `peer` means its connection is gone.
async fn watch_departure<F>(connection: &Connection, peer: UniqueName<'static>, gone: F) -> zbus::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let dbus = DBusProxy::new(connection).await?;
    let mut changes = dbus
        .receive_name_owner_changed_with_args(&[(0, peer.as_str())])
        .await?;

    // Subscribed first, so a departure between the two calls is not missed
    let present = dbus.name_has_owner(BusName::Unique(peer.clone())).await?;

    Ok(tokio::spawn(async move {
        if present {
            let _ = changes.next().await;
        }
        debug!("{} left the bus", peer);
        gone();
    }))
}

/// A method call the peer rejected means it no longer knows us
fn call_error(err: zbus::Error) -> ChannelError {
    match err {
        zbus::Error::MethodError(..) | zbus::Error::FDO(_) => ChannelError::Closed,
        other => ChannelError::Bus(other),
    }
}

/// The listening side of the bus binding
pub struct BusListener {
    connection: Connection,
    name: String,
    peers: PeerTable,
    attached: mpsc::UnboundedReceiver<Attached>,
    max_frame_bytes: usize,
}

impl BusListener {
    /// Serve the mailbox and claim `name`. Fails if the bus is unreachable
    /// or somebody else owns the name.
    pub async fn bind(scope: BusScope, name: &str, max_frame_bytes: usize) -> Result<Self, ChannelError> {
        let connection = bus::connect(scope).await?;

        let peers = PeerTable::default();
        let (tx, rx) = mpsc::unbounded_channel();
        connection
            .object_server()
            .at(
                CHANNEL_PATH,
                Mailbox {
                    role: Role::Listener {
                        peers: Arc::clone(&peers),
                        attached: tx,
                    },
                },
            )
            .await?;

        bus::claim_name(&connection, name).await?;
        info!("Owning {} on the {} bus", name, scope);

        Ok(Self {
            connection,
            name: name.to_string(),
            peers,
            attached: rx,
            max_frame_bytes,
        })
    }

    /// Wait for the next peer to attach. Cancel-safe.
    pub async fn accept(&mut self) -> Result<BusChannel, ChannelError> {
        let attached = self.attached.recv().await.ok_or(ChannelError::Closed)?;

        Ok(BusChannel {
            connection: self.connection.clone(),
            peer: attached.peer,
            inbox: attached.inbox,
            peer_uid: attached.uid,
            peers: Some(Arc::clone(&self.peers)),
            max_frame_bytes: self.max_frame_bytes,
            departure: attached.departure,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
