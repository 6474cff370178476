use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use grammers_client::types::{Chat, Media, Message, PackedChat};
use grammers_client::{Client, Config, InitParams, InvocationError};
use grammers_session::Session;
use grammers_mtsender::ReadError;
use tracing::{debug, info};

use crate::platform::{
    ChatClient, Connector, Credentials, Identity, Login, Peer, PlatformError, RawMessage, Sender,
    Target,
};

/// Marked channel ids (`-100…`) as used by bots and most tooling.
const CHANNEL_ID_OFFSET: i64 = 1_000_000_000_000;

/// A channel reference with URL decoration removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Id(i64),
    Username(String),
}

/// Turn `-100123`, `@name`, `name`, `t.me/name` or `https://t.me/name/42`
/// into a username or numeric chat id.
pub fn parse_reference(reference: &str) -> Result<Reference, PlatformError> {
    let mut rest = reference.trim();
    for scheme in ["https://", "http://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
        }
    }
    for host in ["www.t.me/", "t.me/", "telegram.me/", "telegram.dog/"] {
        if let Some(stripped) = rest.strip_prefix(host) {
            rest = stripped;
            break;
        }
    }
    let rest = rest.split('/').next().unwrap_or_default();
    let name = rest.trim_start_matches('@');

    if name.is_empty() {
        return Err(PlatformError::NotFound(format!(
            "cannot interpret channel reference {reference:?}"
        )));
    }
    match name.parse::<i64>() {
        Ok(id) => Ok(Reference::Id(id)),
        Err(_) => Ok(Reference::Username(name.to_string())),
    }
}

/// Strip the `-100` channel marker or the negative group sign.
pub fn bare_id(id: i64) -> i64 {
    if id <= -CHANNEL_ID_OFFSET {
        -(id + CHANNEL_ID_OFFSET)
    } else {
        id.abs()
    }
}

pub fn encode_session(session: &Session) -> String {
    URL_SAFE_NO_PAD.encode(session.save())
}

pub fn decode_session(token: &str) -> Result<Session, PlatformError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|e| PlatformError::Unauthorized(format!("malformed session token: {e}")))?;
    Session::load(&bytes)
        .map_err(|e| PlatformError::Unauthorized(format!("unreadable session token: {e}")))
}

/// Classify an RPC failure by Telegram's error name.
fn rpc_error(code: i32, name: &str, value: Option<u32>) -> PlatformError {
    match name {
        "FLOOD_WAIT" | "SLOWMODE_WAIT" | "FLOOD_PREMIUM_WAIT" => PlatformError::RateLimited {
            retry_after_secs: value.unwrap_or(0),
        },
        "AUTH_KEY_UNREGISTERED" | "AUTH_KEY_INVALID" | "SESSION_REVOKED" | "SESSION_EXPIRED"
        | "USER_DEACTIVATED" | "USER_DEACTIVATED_BAN" => {
            PlatformError::Unauthorized(name.to_string())
        }
        "CHANNEL_PRIVATE" | "CHAT_ADMIN_REQUIRED" | "CHAT_FORBIDDEN" | "USER_BANNED_IN_CHANNEL" => {
            PlatformError::PermissionDenied(name.to_string())
        }
        "USERNAME_NOT_OCCUPIED" | "USERNAME_INVALID" | "CHANNEL_INVALID" | "PEER_ID_INVALID"
        | "CHAT_ID_INVALID" => PlatformError::NotFound(name.to_string()),
        _ => match code {
            401 => PlatformError::Unauthorized(name.to_string()),
            403 => PlatformError::PermissionDenied(name.to_string()),
            420 => PlatformError::RateLimited {
                retry_after_secs: value.unwrap_or(0),
            },
            _ => PlatformError::Other(format!("{name} (code {code})")),
        },
    }
}

fn platform_error(err: InvocationError) -> PlatformError {
    match err {
        InvocationError::Rpc(rpc) => rpc_error(rpc.code, &rpc.name, rpc.value),
        InvocationError::Read(ReadError::Io(e)) => PlatformError::Network(e.to_string()),
        InvocationError::Dropped => PlatformError::Network("request dropped".to_string()),
        other => PlatformError::Other(other.to_string()),
    }
}

fn chat_sender(chat: &Chat) -> Sender {
    match chat {
        Chat::User(user) => Sender::Person {
            first_name: user.first_name().to_string(),
            last_name: user.last_name().map(str::to_string),
            username: user.username().map(str::to_string),
        },
        other => Sender::Titled {
            title: other.name().to_string(),
        },
    }
}

fn media_name(media: &Media) -> &'static str {
    match media {
        Media::Photo(_) => "photo",
        Media::Document(_) => "document",
        Media::Sticker(_) => "sticker",
        Media::Contact(_) => "contact",
        Media::Poll(_) => "poll",
        _ => "other",
    }
}

/// Counters Telegram reports as `i32`; absent on private chats.
fn assemble(
    id: i32,
    date: DateTime<Utc>,
    text: &str,
    sender: Sender,
    views: Option<i32>,
    forwards: Option<i32>,
    media: Option<&str>,
) -> RawMessage {
    RawMessage {
        id: i64::from(id),
        date: Some(date),
        text: (!text.is_empty()).then(|| text.to_string()),
        sender,
        views: views.map(i64::from),
        forwards: forwards.map(i64::from),
        media: media.map(str::to_string),
    }
}

fn to_raw(msg: &Message) -> RawMessage {
    let sender = match msg.sender() {
        Some(chat) => chat_sender(&chat),
        None => Sender::Unresolved,
    };
    assemble(
        msg.id(),
        msg.date(),
        msg.text(),
        sender,
        msg.view_count(),
        msg.forward_count(),
        msg.media().as_ref().map(media_name),
    )
}

/// Logs in as a user account from a saved session token.
#[derive(Default)]
pub struct UserConnector;

impl UserConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for UserConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ChatClient>, PlatformError> {
        let session = match &credentials.login {
            Login::Session(token) => decode_session(token)?,
            Login::Phone(_) => {
                return Err(PlatformError::Unauthorized(
                    "phone login needs an interactive sign-in; run the setup wizard to create STRING_SESSION"
                        .to_string(),
                ))
            }
        };

        let client = Client::connect(Config {
            session,
            api_id: credentials.api_id,
            api_hash: credentials.api_hash.clone(),
            params: InitParams::default(),
        })
        .await
        .map_err(|e| PlatformError::Network(e.to_string()))?;

        if !client.is_authorized().await.map_err(platform_error)? {
            return Err(PlatformError::Unauthorized(
                "session is no longer signed in".to_string(),
            ));
        }

        info!("Connected to Telegram (app {})", credentials.api_id);
        Ok(Arc::new(UserClient::from_handle(Some(client))))
    }
}

pub struct UserClient {
    handle: RwLock<Option<Client>>,
    connected: AtomicBool,
    /// Chats seen by `resolve`, keyed by bare id
    chats: Mutex<HashMap<i64, PackedChat>>,
}

impl UserClient {
    fn from_handle(handle: Option<Client>) -> Self {
        Self {
            connected: AtomicBool::new(handle.is_some()),
            handle: RwLock::new(handle),
            chats: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self) -> Result<Client, PlatformError> {
        let handle = self.handle.read().ok().and_then(|guard| guard.clone());
        handle.ok_or_else(|| self.observe(PlatformError::Network("client is disconnected".to_string())))
    }

    /// Network failures mean the next job should rebuild the client.
    fn observe(&self, err: PlatformError) -> PlatformError {
        if matches!(err, PlatformError::Network(_)) {
            self.connected.store(false, Ordering::SeqCst);
        }
        err
    }

    fn remember(&self, id: i64, chat: PackedChat) {
        if let Ok(mut chats) = self.chats.lock() {
            chats.insert(id, chat);
        }
    }

    fn cached(&self, id: i64) -> Option<PackedChat> {
        self.chats.lock().ok().and_then(|chats| chats.get(&id).cloned())
    }

    async fn lookup(&self, reference: &str) -> Result<Chat, PlatformError> {
        let client = self.client()?;
        match parse_reference(reference)? {
            Reference::Username(name) => client
                .resolve_username(&name)
                .await
                .map_err(|e| self.observe(platform_error(e)))?
                .ok_or_else(|| PlatformError::NotFound(format!("no chat named @{name}"))),
            Reference::Id(id) => {
                // Without an access hash the chat has to come from our dialogs
                let wanted = bare_id(id);
                let mut dialogs = client.iter_dialogs();
                while let Some(dialog) = dialogs
                    .next()
                    .await
                    .map_err(|e| self.observe(platform_error(e)))?
                {
                    if dialog.chat().id() == wanted {
                        return Ok(dialog.chat().clone());
                    }
                }
                Err(PlatformError::NotFound(format!("chat {id} is not among this account's dialogs")))
            }
        }
    }

    async fn packed(&self, target: &Target) -> Result<PackedChat, PlatformError> {
        match target {
            Target::Resolved(peer) => self
                .cached(peer.id)
                .ok_or_else(|| PlatformError::NotFound(format!("chat {} was not resolved", peer.id))),
            Target::Raw(reference) => {
                let chat = self.lookup(reference).await?;
                Ok(chat.pack())
            }
        }
    }
}

#[async_trait]
impl ChatClient for UserClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut handle) = self.handle.write() {
            handle.take();
        }
        debug!("Dropped Telegram client handle");
    }

    async fn get_me(&self) -> Result<Identity, PlatformError> {
        let me = self
            .client()?
            .get_me()
            .await
            .map_err(|e| self.observe(platform_error(e)))?;
        Ok(Identity {
            id: me.id(),
            name: me.full_name(),
            username: me.username().map(str::to_string),
        })
    }

    async fn resolve(&self, reference: &str) -> Result<Peer, PlatformError> {
        let chat = self.lookup(reference).await?;
        self.remember(chat.id(), chat.pack());
        Ok(Peer {
            id: chat.id(),
            title: Some(chat.name().to_string()),
        })
    }

    fn messages<'a>(
        &'a self,
        target: &'a Target,
        limit: usize,
    ) -> BoxStream<'a, Result<RawMessage, PlatformError>> {
        let start = async move {
            let chat = self.packed(target).await?;
            let client = self.client()?;
            Ok::<_, PlatformError>(client.iter_messages(chat).limit(limit))
        };

        Box::pin(
            stream::once(start)
                .map(move |started| match started {
                    Ok(iter) => stream::try_unfold(iter, move |mut iter| async move {
                        match iter.next().await {
                            Ok(Some(msg)) => Ok(Some((to_raw(&msg), iter))),
                            Ok(None) => Ok(None),
                            Err(e) => Err(self.observe(platform_error(e))),
                        }
                    })
                    .left_stream(),
                    Err(e) => stream::once(future::ready(Err(e))).right_stream(),
                })
                .flatten(),
        )
    }
}
