use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde_json::json;
use tsumugi::{
    dash::parse_mpd,
    key::{CdmKey, CdmSession, ContentDecryptionModule, KeyProvider, KeyType, LicenseRequest},
    select::select,
    EncryptionContext, HttpClient, ResolutionPolicy, SelectionPolicy, StreamKind, TsumugiError,
    TsumugiResult,
};
use url::Url;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::AssertWrapper;

const WIDEVINE_PSSH: &str = "AAAAIHBzc2gtd2lkZXZpbmUtdGVzdC1ib3g=";

fn manifest_url() -> Url {
    Url::parse("https://cdn.example.com/dash/manifest.mpd").unwrap()
}

#[test]
fn test_segment_timeline_template() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/dash/segment-timeline.mpd");
    let representations = parse_mpd(data, &manifest_url())?;

    // the subtitle adaptation is skipped
    assert_eq!(representations.len(), 5);

    let v1080 = representations
        .iter()
        .find(|r| r.id == "v1080")
        .assert_success();
    assert_eq!(v1080.kind, StreamKind::Video);
    assert_eq!((v1080.width, v1080.height), (Some(1920), Some(1080)));
    assert_eq!(v1080.codec.as_deref(), Some("avc1.640028"));
    assert_eq!(
        v1080.init.as_ref().assert_success().url.as_str(),
        "https://cdn.example.com/dash/v1080/init.mp4"
    );
    let urls: Vec<_> = v1080.segments.iter().map(|s| s.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "https://cdn.example.com/dash/v1080/0.m4s",
            "https://cdn.example.com/dash/v1080/4000.m4s",
            "https://cdn.example.com/dash/v1080/8000.m4s",
            "https://cdn.example.com/dash/v1080/12000.m4s",
        ]
    );
    let indices: Vec<_> = v1080.segments.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(v1080.segments[0].duration, Some(4.0));
    assert_eq!(v1080.extension(), "mp4");

    let audio = representations
        .iter()
        .find(|r| r.id == "a-it")
        .assert_success();
    assert_eq!(audio.kind, StreamKind::Audio);
    assert_eq!(audio.language.as_deref(), Some("it"));
    assert_eq!(audio.segments.len(), 4);
    assert_eq!(
        audio.segments[0].url.as_str(),
        "https://cdn.example.com/dash/audio/a-it/00001.m4s"
    );
    assert_eq!(
        audio.segments[3].url.as_str(),
        "https://cdn.example.com/dash/audio/a-it/00004.m4s"
    );
    assert_eq!(audio.extension(), "m4a");
    Ok(())
}

#[test]
fn test_select_best_and_worst() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/dash/segment-timeline.mpd");
    let representations = parse_mpd(data, &manifest_url())?;

    let best = select(&representations, &SelectionPolicy::default())?;
    assert_eq!(best.video.id, "v1080");
    // no preference: highest bandwidth audio
    assert_eq!(best.audio.assert_success().id, "a-it");

    let worst = select(
        &representations,
        &SelectionPolicy {
            resolution: ResolutionPolicy::Worst,
            languages: Vec::new(),
        },
    )?;
    assert_eq!(worst.video.id, "v480");

    let explicit = select(
        &representations,
        &SelectionPolicy {
            resolution: ResolutionPolicy::Explicit("720".to_string()),
            languages: Vec::new(),
        },
    )?;
    assert_eq!(explicit.video.id, "v720");
    Ok(())
}

#[test]
fn test_language_preference_order() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/dash/segment-timeline.mpd");
    let representations = parse_mpd(data, &manifest_url())?;

    let policy = SelectionPolicy {
        resolution: ResolutionPolicy::Best,
        languages: vec!["en".to_string(), "es".to_string(), "it".to_string()],
    };
    let selection = select(&representations, &policy)?;
    assert_eq!(selection.audio.assert_success().id, "a-es");
    Ok(())
}

#[test]
fn test_cenc_uses_first_pssh() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/dash/cenc.mpd");
    let representations = parse_mpd(data, &manifest_url())?;
    assert_eq!(representations.len(), 1);

    let video = &representations[0];
    assert_eq!(
        video.encryption,
        EncryptionContext::Cenc {
            pssh: WIDEVINE_PSSH.to_string(),
            license_url: None,
        }
    );
    assert!(video.encryption.is_encrypted());

    let urls: Vec<_> = video.segments.iter().map(|s| s.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "https://cdn.example.com/dash/seg-video-0.m4s",
            "https://cdn.example.com/dash/seg-video-1.m4s",
        ]
    );

    let licensed = video.with_license_url(Some("https://license.example.com".to_string()));
    assert_eq!(
        licensed.encryption,
        EncryptionContext::Cenc {
            pssh: WIDEVINE_PSSH.to_string(),
            license_url: Some("https://license.example.com".to_string()),
        }
    );
    // the parsed value is never touched
    assert!(matches!(
        &video.encryption,
        EncryptionContext::Cenc {
            license_url: None,
            ..
        }
    ));
    Ok(())
}

#[test]
fn test_segment_list() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/dash/segment-list.mpd");
    let representations = parse_mpd(data, &manifest_url())?;

    let video = &representations[0];
    assert_eq!(
        video.init.as_ref().assert_success().url.as_str(),
        "https://cdn.example.com/dash/init.mp4"
    );
    assert_eq!(video.segments.len(), 10);
    assert_eq!(
        video.segments[9].url.as_str(),
        "https://cdn.example.com/dash/seg-9.m4s"
    );
    Ok(())
}

#[test]
fn test_parse_is_idempotent() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/dash/segment-timeline.mpd");
    let first = parse_mpd(data, &manifest_url())?;
    let second = parse_mpd(data, &manifest_url())?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_invalid_mpd() {
    parse_mpd("<MPD><Period>", &manifest_url()).assert_error();
}

/// Issues a fixed challenge and hands out one content key plus a signing key
/// once it has seen the expected license.
#[derive(Default)]
struct FakeCdm {
    seen_pssh: Arc<Mutex<Vec<Vec<u8>>>>,
}

struct FakeSession {
    seen_pssh: Arc<Mutex<Vec<Vec<u8>>>>,
    license: Option<Vec<u8>>,
}

impl ContentDecryptionModule for FakeCdm {
    fn open(&self) -> TsumugiResult<Box<dyn CdmSession>> {
        Ok(Box::new(FakeSession {
            seen_pssh: self.seen_pssh.clone(),
            license: None,
        }))
    }
}

impl CdmSession for FakeSession {
    fn challenge(&mut self, pssh: &[u8]) -> TsumugiResult<Vec<u8>> {
        self.seen_pssh.lock().unwrap().push(pssh.to_vec());
        Ok(b"challenge-bytes".to_vec())
    }

    fn parse_license(&mut self, license: &[u8]) -> TsumugiResult<()> {
        self.license = Some(license.to_vec());
        Ok(())
    }

    fn keys(&self) -> Vec<CdmKey> {
        if self.license.as_deref() != Some(b"license-bytes".as_slice()) {
            return Vec::new();
        }

        vec![
            CdmKey {
                kid: vec![0x11; 16],
                key: vec![0x22; 16],
                key_type: KeyType::Signing,
            },
            CdmKey {
                kid: vec![0xab; 16],
                key: vec![0xcd; 16],
                key_type: KeyType::Content,
            },
        ]
    }
}

#[tokio::test]
async fn test_license_exchange() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/license"))
        .and(header("x-auth", "secret"))
        .and(body_partial_json(json!({
            "challenge": "Y2hhbGxlbmdlLWJ5dGVz",
            "token": "abc",
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "license": "bGljZW5zZS1ieXRlcw==" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let cdm = Arc::new(FakeCdm::default());
    let seen_pssh = cdm.seen_pssh.clone();
    let provider = KeyProvider::new(HttpClient::default()).with_cdm(cdm);

    let context = EncryptionContext::Cenc {
        pssh: WIDEVINE_PSSH.to_string(),
        license_url: Some(format!("{}/license", server.uri())),
    };
    let request = LicenseRequest {
        license_url: None,
        headers: HashMap::from([("x-auth".to_string(), "secret".to_string())]),
        payload: Some(json!({ "token": "abc" })),
    };
    let keys = provider.resolve(&context, &request).await?;

    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].kid, "ab".repeat(16));
    assert_eq!(keys[0].key, "cd".repeat(16));
    assert_eq!(
        seen_pssh.lock().unwrap().as_slice(),
        &[b"\x00\x00\x00\x20pssh-widevine-test-box".to_vec()]
    );
    Ok(())
}

#[tokio::test]
async fn test_license_server_rejects() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/license"))
        .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
        .mount(&server)
        .await;

    let provider = KeyProvider::new(HttpClient::default()).with_cdm(Arc::new(FakeCdm::default()));
    let context = EncryptionContext::Cenc {
        pssh: WIDEVINE_PSSH.to_string(),
        license_url: None,
    };
    let request = LicenseRequest {
        license_url: Some(format!("{}/license", server.uri())),
        ..Default::default()
    };

    match provider.resolve(&context, &request).await {
        Err(TsumugiError::DecryptionError(message)) => assert!(message.contains("403")),
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}
