//! Chat-protocol gateway adapter.
//!
//! Implements the `tgb-core` [`ProtocolClient`] port over a JSON/HTTP sidecar that owns
//! the actual MTProto connection (sign-in, contact import, uploads, sends).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;

use tgb_core::{
    config::Config,
    domain::{
        AssetHandle, AssetRef, ImageRef, ImportedContacts, PeerUser, RemoteContact, SessionToken,
    },
    errors::Error,
    ports::{LoginPrompts, ProtocolClient},
    utils::truncate_text,
    Result,
};

const CONNECTION_RETRIES: u32 = 5;
const UPLOAD_FILE_NAME: &str = "image.jpg";

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_id: i32,
    pub api_hash: String,
    pub session: Option<SessionToken>,
    pub timeout: Duration,
}

impl GatewayConfig {
    pub fn from_config(cfg: &Config, session: Option<SessionToken>) -> Self {
        Self {
            base_url: cfg.gateway_url.clone(),
            api_id: cfg.api_id,
            api_hash: cfg.api_hash.clone(),
            session,
            timeout: cfg.request_timeout,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewayClient {
    cfg: GatewayConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Ack {}

#[derive(Debug, Deserialize)]
struct AuthStatus {
    authorized: bool,
}

#[derive(Debug, Deserialize)]
struct SentCode {
    phone_code_hash: String,
}

#[derive(Debug, Deserialize)]
struct SignedIn {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    password_required: bool,
}

#[derive(Debug, Deserialize)]
struct Uploaded {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct ContactList {
    #[serde(default)]
    users: Vec<RemoteContact>,
}

impl GatewayClient {
    pub fn new(cfg: GatewayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::External(format!("gateway client build error: {e}")))?;
        Ok(Self { cfg, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.cfg.base_url.trim_end_matches('/'))
    }

    fn map_err(e: reqwest::Error) -> Error {
        Error::External(format!("gateway request error: {e}"))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(Self::map_err)?;
        decode(resp).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(Self::map_err)?;
        decode(resp).await
    }

    async fn post_form<T: DeserializeOwned>(&self, path: &str, form: Form) -> Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .multipart(form)
            .send()
            .await
            .map_err(Self::map_err)?;
        decode(resp).await
    }

    async fn image_part(image: &ImageRef) -> Result<Part> {
        let (bytes, name) = match image {
            ImageRef::Path(p) => {
                let bytes = tokio::fs::read(p).await.map_err(Error::Io)?;
                let name = p
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or(UPLOAD_FILE_NAME)
                    .to_string();
                (bytes, name)
            }
            ImageRef::Blob(b) => (b.to_vec(), UPLOAD_FILE_NAME.to_string()),
        };
        Ok(Part::bytes(bytes).file_name(name))
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let body = resp.text().await.map_err(GatewayClient::map_err)?;
    if !status.is_success() {
        return Err(provider_error(status.as_u16(), &body));
    }
    let body = if body.trim().is_empty() {
        "{}"
    } else {
        body.as_str()
    };
    serde_json::from_str(body).map_err(|e| {
        Error::External(format!(
            "gateway json error: {e}: {}",
            truncate_text(body, 200)
        ))
    })
}

fn provider_error(status: u16, body: &str) -> Error {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            seconds: Some(seconds),
            ..
        }) if status == 420 || status == 429 => Error::RateLimited { seconds },
        Ok(ErrorBody { error, seconds }) => Error::Provider {
            message: error,
            wait_seconds: seconds,
        },
        Err(_) => Error::provider(format!("gateway {status}: {}", truncate_text(body, 200))),
    }
}

fn is_provider_code(e: &Error, codes: &[&str]) -> bool {
    matches!(e, Error::Provider { message, .. } if codes.iter().any(|c| message.contains(c)))
}

#[async_trait]
impl ProtocolClient for GatewayClient {
    async fn connect(&self) -> Result<()> {
        let _: Ack = self
            .post(
                "/connect",
                &json!({
                    "api_id": self.cfg.api_id,
                    "api_hash": self.cfg.api_hash,
                    "session": self.cfg.session.as_ref().map(|s| s.0.as_str()).unwrap_or(""),
                    "connection_retries": CONNECTION_RETRIES,
                }),
            )
            .await?;
        tracing::debug!(gateway = %self.cfg.base_url, "connected");
        Ok(())
    }

    async fn check_authorized(&self) -> Result<bool> {
        let st: AuthStatus = self.get("/auth/status").await?;
        Ok(st.authorized)
    }

    async fn login(&self, prompts: &dyn LoginPrompts) -> Result<SessionToken> {
        let (phone, phone_code_hash) = loop {
            let phone = prompts.phone_number().await?;
            match self
                .post::<SentCode>("/auth/send-code", &json!({ "phone": phone }))
                .await
            {
                Ok(sent) => break (phone, sent.phone_code_hash),
                Err(e) if is_provider_code(&e, &["PHONE_NUMBER_INVALID"]) => prompts.on_error(&e),
                Err(e) => return Err(e),
            }
        };

        let signed = loop {
            let code = prompts.phone_code().await?;
            match self
                .post::<SignedIn>(
                    "/auth/sign-in",
                    &json!({
                        "phone": phone,
                        "code": code,
                        "phone_code_hash": phone_code_hash,
                    }),
                )
                .await
            {
                Ok(s) => break s,
                Err(e) if is_provider_code(&e, &["PHONE_CODE_INVALID", "PHONE_CODE_EMPTY"]) => {
                    prompts.on_error(&e)
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(session) = signed.session {
            return Ok(SessionToken(session));
        }
        if !signed.password_required {
            return Err(Error::AuthChallenge(
                "gateway returned neither a session nor a password request".to_string(),
            ));
        }

        loop {
            let password = prompts.password().await?;
            match self
                .post::<SignedIn>("/auth/password", &json!({ "password": password }))
                .await
            {
                Ok(SignedIn {
                    session: Some(session),
                    ..
                }) => return Ok(SessionToken(session)),
                Ok(_) => {
                    return Err(Error::AuthChallenge(
                        "gateway returned no session after password".to_string(),
                    ))
                }
                Err(e) if is_provider_code(&e, &["PASSWORD_HASH_INVALID"]) => prompts.on_error(&e),
                Err(e) => return Err(e),
            }
        }
    }

    async fn export_session(&self) -> Result<SessionToken> {
        let signed: SignedIn = self.get("/auth/session").await?;
        signed
            .session
            .map(SessionToken)
            .ok_or_else(|| Error::External("gateway has no session to export".to_string()))
    }

    async fn import_contact(&self, phone: &str, correlation_id: i64) -> Result<ImportedContacts> {
        self.post(
            "/contacts/import",
            &json!({
                "phone": phone,
                "client_id": correlation_id,
                "first_name": "Contact",
                "last_name": "Telegram",
            }),
        )
        .await
    }

    async fn send_message(&self, user: &PeerUser, text: &str) -> Result<()> {
        let _: Ack = self
            .post(
                "/messages/text",
                &json!({ "user": user, "message": text }),
            )
            .await?;
        Ok(())
    }

    async fn send_file_with_caption(
        &self,
        user: &PeerUser,
        asset: &AssetRef,
        caption: &str,
    ) -> Result<()> {
        let mut form = Form::new()
            .text("user", serde_json::to_string(user)?)
            .text("caption", caption.to_string())
            // Photo, not a generic document attachment.
            .text("force_document", "false");
        form = match asset {
            AssetRef::Uploaded(handle) => form.text("file_handle", handle.0.clone()),
            AssetRef::Local(image) => form.part("file", Self::image_part(image).await?),
        };
        let _: Ack = self.post_form("/messages/file", form).await?;
        Ok(())
    }

    async fn upload_asset(&self, image: &ImageRef) -> Result<AssetHandle> {
        let form = Form::new()
            .text("workers", "1")
            .part("file", Self::image_part(image).await?);
        let up: Uploaded = self
            .post_form("/uploads", form)
            .await
            .map_err(|e| Error::Upload(e.to_string()))?;
        Ok(AssetHandle(up.handle))
    }

    async fn list_contacts(&self) -> Result<Vec<RemoteContact>> {
        let list: ContactList = self.get("/contacts").await?;
        Ok(list.users)
    }
}
