use std::{ops::Deref, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{header::RANGE, Client, ClientBuilder, IntoUrl, Url};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};

use crate::{
    error::{TsumugiError, TsumugiResult},
    progress::ByteCounter,
    util::range::ByteRange,
};

/// Longest error body echoed into logs.
const MAX_ERROR_BODY: usize = 512;

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies_store: Arc<CookieStoreMutex>,
    counter: ByteCounter,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> TsumugiResult<Self> {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder.cookie_provider(cookies_store.clone()).build()?;

        Ok(Self {
            client,
            cookies_store,
            counter: ByteCounter::default(),
        })
    }

    /// Share a byte counter with this client. Every received body chunk is
    /// added to it.
    pub fn with_counter(mut self, counter: ByteCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn counter(&self) -> &ByteCounter {
        &self.counter
    }

    pub fn add_cookies(&self, cookies: Vec<String>, url: impl IntoUrl) -> TsumugiResult<()> {
        let url = url.into_url()?;
        let mut lock = self
            .cookies_store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for cookie in cookies {
            _ = lock.parse(&cookie, &url);
        }
        Ok(())
    }

    /// GET `url` and collect its body, optionally restricted to `range`.
    pub async fn fetch(&self, url: Url, range: Option<&ByteRange>) -> TsumugiResult<Bytes> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range.to_http_range());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            if let Ok(body) = response.text().await {
                let body: String = body.chars().take(MAX_ERROR_BODY).collect();
                tracing::warn!("Error body: {body}");
            }
            return Err(TsumugiError::HttpError(status));
        }

        let mut data = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            self.counter.add(chunk.len() as u64);
            data.extend_from_slice(&chunk);
        }

        Ok(data.freeze())
    }

    /// GET a text document. Returns the final URL after redirects, the
    /// `Content-Type` header and the body.
    pub async fn fetch_text(&self, url: Url) -> TsumugiResult<(Url, Option<String>, String)> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(TsumugiError::HttpError(response.status()));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|s| s.to_str().ok())
            .map(|r| r.to_lowercase());
        let body = response.text().await?;
        self.counter.add(body.len() as u64);

        Ok((final_url, content_type, body))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = Client::builder()
            .cookie_provider(cookies_store.clone())
            .build()
            .unwrap_or_default();

        Self {
            client,
            cookies_store,
            counter: ByteCounter::default(),
        }
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
