//! Session registry and connection identification.
//!
//! A logical session outlives any single socket. Right after connecting,
//! the client is asked to identify itself with a `{user, session}` pair;
//! the registry then routes the transport to the [`Session`] holding that
//! identity's state, creating it on first contact. Reconnects, new tabs
//! and network blips all land back on the same server-side state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::Envelope;
use crate::session::Session;
use crate::transport::{Frame, Transport, TransportReader};
use crate::{SyncError, SyncResult};

/// Event asking the client to identify itself.
pub const IDENTIFY_REQUEST: &str = "_IDENTIFY";

/// Event carrying the client's identity reply.
pub const IDENTIFY_REPLY: &str = "_IDENTITY";

/// Client-supplied identity of a logical session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
    /// May be empty in the reply; the server mints one in that case.
    #[serde(default)]
    pub session: String,
}

struct Entry {
    session: Session,
    last_attached: DateTime<Utc>,
}

/// All live sessions, keyed by identity.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Identity, Entry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, identity: &Identity) -> Option<Session> {
        self.sessions.get(identity).map(|e| e.session.clone())
    }

    /// When the identity's session last adopted a transport.
    pub fn last_attached(&self, identity: &Identity) -> Option<DateTime<Utc>> {
        self.sessions.get(identity).map(|e| e.last_attached)
    }

    /// Close and drop a session.
    pub fn remove(&self, identity: &Identity) -> bool {
        match self.sessions.remove(identity) {
            Some((_, entry)) => {
                entry.session.close();
                true
            }
            None => false,
        }
    }

    /// Drive one incoming connection: identify the peer, route the
    /// transport to its session and run the read loop until the
    /// connection ends. `init` runs inside the session's ambient scope
    /// the first time an identity is seen, to construct its synced
    /// objects.
    pub async fn serve<F>(&self, transport: Box<dyn Transport>, init: F) -> SyncResult<()>
    where
        F: FnOnce(&Session),
    {
        let (mut reader, mut writer) = transport.split();

        let request = Envelope::new(IDENTIFY_REQUEST, Value::Null);
        writer.send(Frame::Text(request.encode()?)).await?;

        let identity = match identify(reader.as_mut()).await {
            Ok(identity) => identity,
            Err(e) => {
                writer.close().await;
                return Err(e);
            }
        };

        let mut created = false;
        let session = {
            let mut entry = self.sessions.entry(identity.clone()).or_insert_with(|| {
                created = true;
                Entry {
                    session: Session::new(),
                    last_attached: Utc::now(),
                }
            });
            entry.last_attached = Utc::now();
            entry.session.clone()
        };

        if created {
            info!(user = %identity.user, session = %identity.session, "creating session");
            session.scope(|| init(&session));
        } else {
            debug!(user = %identity.user, session = %identity.session, "reattaching session");
        }

        session.attach_split(reader, writer)?;
        session.run().await
    }
}

async fn identify(reader: &mut dyn TransportReader) -> SyncResult<Identity> {
    match reader.recv().await? {
        Frame::Text(text) => {
            let env = Envelope::decode(&text)?;
            if env.event != IDENTIFY_REPLY {
                return Err(SyncError::Identify(format!(
                    "expected {IDENTIFY_REPLY}, got {}",
                    env.event
                )));
            }
            let mut identity: Identity =
                serde_json::from_value(env.data).map_err(|e| SyncError::Identify(e.to_string()))?;
            if identity.user.is_empty() {
                return Err(SyncError::Identify("empty user id".into()));
            }
            if identity.session.is_empty() {
                identity.session = Uuid::new_v4().to_string();
            }
            Ok(identity)
        }
        Frame::Binary(_) => Err(SyncError::Identify(
            "binary frame during identification".into(),
        )),
    }
}
