use crate::providers::ProviderError;

const PROVIDER: &str = "youtube";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelIdentity {
  pub channel_id: String,
  pub title: Option<String>,
}

/// Looks up the channel owned by `access_token` through the YouTube Data API.
pub async fn fetch_my_channel(access_token: &str, base_url: &str) -> Result<ChannelIdentity, ProviderError> {
  let connector = hyper_rustls::HttpsConnectorBuilder::new()
    .with_native_roots()
    .map_err(|e| ProviderError::transport(PROVIDER, e))?
    .https_or_http()
    .enable_http1()
    .build();

  let client =
    hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);

  let mut hub = google_youtube3::YouTube::new(client, access_token.to_string());
  hub.base_url(base_url.to_string());
  hub.root_url(base_url.to_string());

  let (_, response) = hub
    .channels()
    .list(&vec!["id".into(), "snippet".into()])
    .mine(true)
    .doit()
    .await
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;

  response
    .items
    .unwrap_or_default()
    .into_iter()
    .find_map(|channel| {
      let channel_id = channel.id?;
      let title = channel.snippet.and_then(|s| s.title);
      Some(ChannelIdentity { channel_id, title })
    })
    .ok_or_else(|| ProviderError::new(PROVIDER, None, "No channel found for this token"))
}
