use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// How a sheet operation failed, after the gateway's own retry loop.
///
/// `Transient` is the only retryable kind; everything else surfaces to the
/// caller unchanged on the first occurrence.
#[derive(Debug, Clone, Error)]
pub enum SheetError {
    #[error("transient transport error: {0}")]
    Transient(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid response: {0}")]
    Invalid(String),
}

impl SheetError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SheetError::Transient(_))
    }
}

/// One data row of a tab, keyed by header cell text.
#[derive(Debug, Clone)]
pub struct SheetRecord {
    /// 1-based sheet row number (header is row 1).
    pub row: u32,
    pub fields: BTreeMap<String, String>,
}

/// Headers plus data rows of one tab, blank trailing rows trimmed.
#[derive(Debug, Clone)]
pub struct TabData {
    pub headers: Vec<String>,
    pub records: Vec<SheetRecord>,
}

/// Normalize an email for the profile-mapping lookup.
///
/// Case-insensitive everywhere; for Gmail-hosted addresses the dots in the
/// local part and any `+tag` suffix are dropped (`a.b+x@gmail.com` and
/// `ab@gmail.com` are the same mailbox). This is the only fuzzy match in
/// the keeper and it is scoped to that lookup.
pub fn normalize_gmail(email: &str) -> String {
    let lower = email.trim().to_ascii_lowercase();
    let Some((local, domain)) = lower.split_once('@') else {
        return lower;
    };
    if domain == "gmail.com" || domain == "googlemail.com" {
        let local = local.split('+').next().unwrap_or(local).replace('.', "");
        format!("{local}@gmail.com")
    } else {
        lower
    }
}

/// Coordinates of a bare A1 cell reference, e.g. `E5` -> `(4, 5)`.
pub fn a1_coords(cell: &str) -> Option<(usize, u32)> {
    let split = cell.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = cell.split_at(split);
    if letters.is_empty() {
        return None;
    }
    let mut col = 0usize;
    for c in letters.chars() {
        if !c.is_ascii_uppercase() {
            return None;
        }
        col = col * 26 + (c as usize - 'A' as usize + 1);
    }
    Some((col - 1, digits.parse().ok()?))
}

/// Raw transport under the gateway. The production implementation speaks
/// the Sheets v4 REST API; tests substitute an in-memory one.
#[async_trait]
pub trait SheetTransport: Send + Sync {
    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, SheetError>;
    async fn update_values(
        &self,
        range: &str,
        values: Vec<Vec<String>>,
    ) -> Result<(), SheetError>;
    /// One round trip; update order within the batch is preserved.
    async fn batch_update_values(
        &self,
        updates: Vec<(String, Vec<Vec<String>>)>,
    ) -> Result<(), SheetError>;
    async fn sheet_titles(&self) -> Result<Vec<String>, SheetError>;
    async fn add_sheet(&self, title: &str) -> Result<(), SheetError>;
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Typed read/write over a single spreadsheet with bounded retry on
/// transient transport errors. Per-attempt timeouts live in the transport.
pub struct SheetsClient<T> {
    transport: T,
}

impl<T: SheetTransport> SheetsClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn with_retries<V, F, Fut>(op: &str, mut call: F) -> Result<V, SheetError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<V, SheetError>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        for attempt in 1..=RETRY_ATTEMPTS {
            match call().await {
                Ok(v) => return Ok(v),
                Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    tracing::warn!(
                        op,
                        attempt,
                        sleep_ms = delay.as_millis() as u64,
                        error = %err,
                        "sheet call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("retry loop always returns");
    }

    fn tab_range(tab: &str, suffix: Option<&str>) -> String {
        match suffix {
            Some(cell) => format!("'{tab}'!{cell}"),
            None => format!("'{tab}'"),
        }
    }

    /// Read a whole tab as header-keyed records. Blank rows are skipped but
    /// still count toward row numbering, so write-backs land on the right
    /// physical row.
    pub async fn read_records(&self, tab: &str) -> Result<TabData, SheetError> {
        let range = Self::tab_range(tab, None);
        let values =
            Self::with_retries("readRange", || self.transport.get_values(&range)).await?;

        let mut iter = values.into_iter();
        let headers: Vec<String> = iter
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut records = Vec::new();
        for (i, cells) in iter.enumerate() {
            if cells.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            let mut fields = BTreeMap::new();
            for (h, v) in headers.iter().zip(cells.into_iter()) {
                if !h.is_empty() {
                    fields.insert(h.clone(), v);
                }
            }
            records.push(SheetRecord {
                row: (i + 2) as u32,
                fields,
            });
        }

        Ok(TabData { headers, records })
    }

    /// Read a tab as raw rows, no header interpretation. Used for the
    /// key/value config tab.
    pub async fn read_rows(&self, tab: &str) -> Result<Vec<Vec<String>>, SheetError> {
        let range = Self::tab_range(tab, None);
        Self::with_retries("readRows", || self.transport.get_values(&range)).await
    }

    /// Read one cell; empty string when the cell is blank.
    pub async fn read_cell(&self, tab: &str, cell: &str) -> Result<String, SheetError> {
        let range = Self::tab_range(tab, Some(&format!("{cell}:{cell}")));
        let values =
            Self::with_retries("readCell", || self.transport.get_values(&range)).await?;
        Ok(values
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or_default())
    }

    pub async fn write_cell(&self, tab: &str, cell: &str, value: &str) -> Result<(), SheetError> {
        let range = Self::tab_range(tab, Some(cell));
        Self::with_retries("writeCell", || {
            self.transport
                .update_values(&range, vec![vec![value.to_string()]])
        })
        .await
    }

    /// One batched round trip; cell order is preserved.
    pub async fn write_batch(
        &self,
        tab: &str,
        updates: &[(String, String)],
    ) -> Result<(), SheetError> {
        if updates.is_empty() {
            return Ok(());
        }
        let payload: Vec<(String, Vec<Vec<String>>)> = updates
            .iter()
            .map(|(cell, value)| {
                (
                    Self::tab_range(tab, Some(cell)),
                    vec![vec![value.clone()]],
                )
            })
            .collect();
        Self::with_retries("writeBatch", || {
            self.transport.batch_update_values(payload.clone())
        })
        .await
    }

    pub async fn list_tabs(&self) -> Result<Vec<String>, SheetError> {
        Self::with_retries("listTabs", || self.transport.sheet_titles()).await
    }

    pub async fn ensure_tab(&self, name: &str) -> Result<(), SheetError> {
        let titles = self.list_tabs().await?;
        if titles.iter().any(|t| t == name) {
            return Ok(());
        }
        tracing::info!(tab = name, "creating missing tab");
        Self::with_retries("ensureTab", || self.transport.add_sheet(name)).await
    }
}

/// Subset of a Google service-account key file used for the JWT grant.
/// Extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("failed to read credentials file {}: {e}", path.display()))?;
        let key: ServiceAccountKey = serde_json::from_str(&raw)
            .map_err(|e| eyre::eyre!("failed to parse credentials file {}: {e}", path.display()))?;
        if key.client_email.trim().is_empty() || key.private_key.trim().is_empty() {
            return Err(eyre::eyre!(
                "credentials file {} is missing client_email/private_key",
                path.display()
            ));
        }
        Ok(key)
    }
}

#[derive(serde::Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    bearer: String,
    expires_at: std::time::Instant,
}

const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sheets v4 REST transport with a cached service-account bearer token.
pub struct HttpSheetTransport {
    http: reqwest::Client,
    base: String,
    spreadsheet_id: String,
    key: ServiceAccountKey,
    encoding_key: jsonwebtoken::EncodingKey,
    token: tokio::sync::Mutex<Option<CachedToken>>,
}

impl HttpSheetTransport {
    pub fn new(spreadsheet_id: String, key: ServiceAccountKey) -> eyre::Result<Self> {
        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| eyre::eyre!("credentials private_key is not a valid RSA PEM: {e}"))?;
        let http = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .map_err(|e| eyre::eyre!("failed to build http client: {e}"))?;
        Ok(Self {
            http,
            base: "https://sheets.googleapis.com".to_string(),
            spreadsheet_id,
            key,
            encoding_key,
            token: tokio::sync::Mutex::new(None),
        })
    }

    async fn bearer(&self) -> Result<String, SheetError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            // 60 s slack so a token never expires mid-request.
            if cached.expires_at > std::time::Instant::now() + Duration::from_secs(60) {
                return Ok(cached.bearer.clone());
            }
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = GrantClaims {
            iss: &self.key.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let jwt = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &self.encoding_key,
        )
        .map_err(|e| SheetError::Invalid(format!("jwt encode failed: {e}")))?;

        let resp = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", jwt.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SheetError::Transient(format!("token request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, format!("token grant: {body}")));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SheetError::Invalid(format!("token response malformed: {e}")))?;

        let bearer = token.access_token;
        *guard = Some(CachedToken {
            bearer: bearer.clone(),
            expires_at: std::time::Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(bearer)
    }

    async fn api(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, SheetError> {
        let bearer = self.bearer().await?;
        let url = format!("{}{path}", self.base);
        let mut req = self.http.request(method, &url).bearer_auth(bearer);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| SheetError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        resp.json()
            .await
            .map_err(|e| SheetError::Invalid(format!("response body malformed: {e}")))
    }

    fn values_path(&self, range: &str, query: &str) -> String {
        format!(
            "/v4/spreadsheets/{}/values/{}{query}",
            self.spreadsheet_id,
            urlencoding::encode(range)
        )
    }
}

fn classify_status(status: reqwest::StatusCode, body: String) -> SheetError {
    let detail = format!("{status}: {}", truncate(&body, 200));
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        SheetError::PermissionDenied(detail)
    } else if status == reqwest::StatusCode::NOT_FOUND {
        SheetError::NotFound(detail)
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SheetError::Transient(detail)
    } else {
        SheetError::Invalid(detail)
    }
}

fn truncate(s: &str, max: usize) -> String {
    // Char-based to avoid slicing on a non-UTF8 boundary.
    let mut out: String = s.chars().take(max).collect();
    if out.len() < s.len() {
        out.push_str("...");
    }
    out
}

#[async_trait]
impl SheetTransport for HttpSheetTransport {
    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, SheetError> {
        let path = self.values_path(range, "?majorDimension=ROWS");
        let body = self.api(reqwest::Method::GET, &path, None).await?;
        let values = body
            .get("values")
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));
        serde_json::from_value::<Vec<Vec<serde_json::Value>>>(values)
            .map(|rows| {
                rows.into_iter()
                    .map(|row| {
                        row.into_iter()
                            .map(|cell| match cell {
                                serde_json::Value::String(s) => s,
                                other => other.to_string(),
                            })
                            .collect()
                    })
                    .collect()
            })
            .map_err(|e| SheetError::Invalid(format!("values payload malformed: {e}")))
    }

    async fn update_values(
        &self,
        range: &str,
        values: Vec<Vec<String>>,
    ) -> Result<(), SheetError> {
        let path = self.values_path(range, "?valueInputOption=RAW");
        self.api(
            reqwest::Method::PUT,
            &path,
            Some(serde_json::json!({ "values": values })),
        )
        .await
        .map(|_| ())
    }

    async fn batch_update_values(
        &self,
        updates: Vec<(String, Vec<Vec<String>>)>,
    ) -> Result<(), SheetError> {
        let data: Vec<serde_json::Value> = updates
            .into_iter()
            .map(|(range, values)| serde_json::json!({ "range": range, "values": values }))
            .collect();
        let path = format!(
            "/v4/spreadsheets/{}/values:batchUpdate",
            self.spreadsheet_id
        );
        self.api(
            reqwest::Method::POST,
            &path,
            Some(serde_json::json!({
                "valueInputOption": "RAW",
                "data": data,
            })),
        )
        .await
        .map(|_| ())
    }

    async fn sheet_titles(&self) -> Result<Vec<String>, SheetError> {
        let path = format!(
            "/v4/spreadsheets/{}?fields=sheets.properties.title",
            self.spreadsheet_id
        );
        let body = self.api(reqwest::Method::GET, &path, None).await?;
        let sheets = body
            .get("sheets")
            .and_then(|s| s.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(sheets
            .iter()
            .filter_map(|s| {
                s.pointer("/properties/title")
                    .and_then(|t| t.as_str())
                    .map(String::from)
            })
            .collect())
    }

    async fn add_sheet(&self, title: &str) -> Result<(), SheetError> {
        let path = format!("/v4/spreadsheets/{}:batchUpdate", self.spreadsheet_id);
        self.api(
            reqwest::Method::POST,
            &path,
            Some(serde_json::json!({
                "requests": [{ "addSheet": { "properties": { "title": title } } }]
            })),
        )
        .await
        .map(|_| ())
    }
}
