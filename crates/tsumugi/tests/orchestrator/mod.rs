use std::{num::NonZeroU32, path::Path, time::Duration};

use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use tsumugi::{
    download::RetryPolicy, DownloadOrchestrator, DownloadRequest, DownloadState, EngineConfig,
    Interrupt,
};
use url::Url;
use wiremock::MockServer;

use crate::{
    segment_payload, segment_requests, setup_mock_server, AssertWrapper, ConcatMuxer, SegmentMock,
    StopAfter,
};

const KEY: [u8; 16] = *b"tsumugi-test-key";

fn config(temp_dir: &Path) -> EngineConfig {
    EngineConfig {
        temp_dir: temp_dir.to_path_buf(),
        retry: RetryPolicy {
            max_attempts: 2,
            backoff_base: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            max_global_rounds: 1,
        },
        ..Default::default()
    }
}

fn orchestrator(config: EngineConfig, interrupt: Interrupt) -> DownloadOrchestrator<ConcatMuxer> {
    DownloadOrchestrator::builder()
        .config(config)
        .interrupt(interrupt)
        .muxer(ConcatMuxer)
        .build()
}

/// A VOD media playlist with `count` segments at `seg/{index}.ts`.
fn media_playlist(count: usize, encrypted: bool) -> String {
    let mut playlist = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    if encrypted {
        playlist.push_str("#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n");
    }
    for index in 0..count {
        playlist.push_str(&format!("#EXTINF:4.0,\nseg/{index}.ts\n"));
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    playlist
}

fn encrypt(sequence: u64, data: &[u8]) -> Vec<u8> {
    let iv = (sequence as u128).to_be_bytes();
    cbc::Encryptor::<Aes128>::new(&KEY.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
}

#[tokio::test]
async fn test_hls_aes_download() -> anyhow::Result<()> {
    let (playlist_url, server) =
        setup_mock_server("/hls/playlist.m3u8", &media_playlist(5, true)).await;
    server.mock_bytes("/hls/key.bin", KEY.to_vec()).await;
    for index in 0..5 {
        server
            .mock_bytes(
                &format!("/hls/seg/{index}.ts"),
                encrypt(index as u64, &segment_payload(index)),
            )
            .await;
    }

    let temp = tempfile::tempdir()?;
    let output = temp.path().join("out/video.ts");
    let orchestrator = orchestrator(config(temp.path()), Interrupt::new());
    let result = orchestrator
        .run(DownloadRequest::new(Url::parse(&playlist_url)?, &output))
        .await;

    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.path.as_deref(), Some(output.as_path()));
    assert_eq!(orchestrator.state(), DownloadState::Done);

    let expected: Vec<u8> = (0..5).flat_map(segment_payload).collect();
    assert_eq!(tokio::fs::read(&output).await?, expected);

    // only the output is left behind
    let mut entries = tokio::fs::read_dir(temp.path()).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name());
    }
    assert_eq!(names, vec!["out"]);
    Ok(())
}

#[tokio::test]
async fn test_dash_download_with_init() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/dash/segment-list.mpd");
    let (manifest_url, server) = setup_mock_server("/dash/manifest.mpd", data).await;
    server.mock_bytes("/dash/init.mp4", b"<init>".to_vec()).await;
    for index in 0..10 {
        server
            .mock_bytes(&format!("/dash/seg-{index}.m4s"), segment_payload(index))
            .await;
    }

    let temp = tempfile::tempdir()?;
    let output = temp.path().join("video.mp4");
    let orchestrator = orchestrator(config(temp.path()), Interrupt::new());
    let result = orchestrator
        .run(DownloadRequest::new(Url::parse(&manifest_url)?, &output))
        .await;

    assert!(result.is_success(), "{result:?}");
    let mut expected = b"<init>".to_vec();
    expected.extend((0..10).flat_map(segment_payload));
    assert_eq!(tokio::fs::read(&output).await?, expected);
    Ok(())
}

#[tokio::test]
async fn test_missing_segments_fail_the_run() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/dash/segment-list.mpd");
    let (manifest_url, server) = setup_mock_server("/dash/manifest.mpd", data).await;
    server.mock_bytes("/dash/init.mp4", b"<init>".to_vec()).await;
    for index in 0..10 {
        if index == 2 || index == 5 {
            server
                .mock_status(&format!("/dash/seg-{index}.m4s"), 404)
                .await;
        } else {
            server
                .mock_bytes(&format!("/dash/seg-{index}.m4s"), segment_payload(index))
                .await;
        }
    }

    let temp = tempfile::tempdir()?;
    let output = temp.path().join("video.mp4");
    let orchestrator = orchestrator(config(temp.path()), Interrupt::new());
    let result = orchestrator
        .run(DownloadRequest::new(Url::parse(&manifest_url)?, &output))
        .await;

    assert!(!result.stopped);
    assert!(result.path.is_none());
    let error = result.error.assert_success();
    assert!(error.contains("8/10"), "{error}");
    assert!(error.contains("missing: [2, 5]"), "{error}");
    assert_eq!(orchestrator.state(), DownloadState::Failed);
    assert!(!output.exists());
    Ok(())
}

#[tokio::test]
async fn test_decrypt_failure_halts_audio() -> anyhow::Result<()> {
    use wiremock::{
        matchers::{method, path_regex},
        Mock, ResponseTemplate,
    };

    let master = r#"#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aac",LANGUAGE="en",NAME="English",DEFAULT=YES,URI="audio/audio.m3u8"
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=854x480,AUDIO="aac"
video.m3u8
"#;
    let (master_url, server) = setup_mock_server("/hls/master.m3u8", master).await;
    server
        .mock_bytes("/hls/video.m3u8", media_playlist(5, true).into_bytes())
        .await
        .mock_bytes("/hls/audio/audio.m3u8", media_playlist(100, false).into_bytes())
        .await
        .mock_bytes("/hls/key.bin", KEY.to_vec())
        .await;
    // not a whole number of cipher blocks
    for index in 0..5 {
        server
            .mock_bytes(&format!("/hls/seg/{index}.ts"), segment_payload(index))
            .await;
    }
    Mock::given(method("GET"))
        .and(path_regex(r"^/hls/audio/seg/\d+\.ts$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(segment_payload(0))
                .set_delay(Duration::from_millis(50)),
        )
        .mount(&server)
        .await;

    let temp = tempfile::tempdir()?;
    let config = EngineConfig {
        video_concurrency: NonZeroU32::MIN,
        audio_concurrency: NonZeroU32::MIN,
        ..config(temp.path())
    };
    let interrupt = Interrupt::new();
    let orchestrator = orchestrator(config, interrupt.clone());
    let result = orchestrator
        .run(DownloadRequest::new(
            Url::parse(&master_url)?,
            temp.path().join("video.ts"),
        ))
        .await;

    assert!(!result.stopped);
    assert!(result.path.is_none());
    let error = result.error.assert_success();
    assert!(error.contains("Decryption"), "{error}");
    assert_eq!(orchestrator.state(), DownloadState::Failed);
    assert!(!interrupt.is_stopped());
    assert!(segment_requests(&server, "/hls/audio/seg").await < 10);
    Ok(())
}

#[tokio::test]
async fn test_stop_keeps_partial_output() -> anyhow::Result<()> {
    let (playlist_url, server) =
        setup_mock_server("/hls/playlist.m3u8", &media_playlist(100, false)).await;
    let interrupt = Interrupt::new();
    StopAfter::new(interrupt.clone(), 40)
        .mount(&server, "/hls/seg")
        .await;

    let temp = tempfile::tempdir()?;
    let output = temp.path().join("video.ts");
    let config = EngineConfig {
        video_concurrency: NonZeroU32::MIN,
        ..config(temp.path())
    };
    let orchestrator = orchestrator(config, interrupt);
    let result = orchestrator
        .run(DownloadRequest::new(Url::parse(&playlist_url)?, &output))
        .await;

    assert!(result.stopped);
    assert!(result.error.is_none());
    assert_eq!(orchestrator.state(), DownloadState::Stopped);
    assert_eq!(segment_requests(&server, "/hls/seg").await, 40);

    let partial = result.path.assert_success();
    let expected: Vec<u8> = (0..40).flat_map(segment_payload).collect();
    assert_eq!(tokio::fs::read(&partial).await?, expected);
    assert!(!output.exists());

    let workdir = partial.parent().assert_success();
    assert!(workdir.join("video.m3u8").is_file());
    assert!(tokio::fs::read(workdir.join("video_0.ts")).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stopped_before_start() -> anyhow::Result<()> {
    let (playlist_url, server) =
        setup_mock_server("/hls/playlist.m3u8", &media_playlist(3, false)).await;
    let interrupt = Interrupt::new();
    StopAfter::new(interrupt.clone(), usize::MAX)
        .mount(&server, "/hls/seg")
        .await;
    interrupt.stop();

    let temp = tempfile::tempdir()?;
    let orchestrator = orchestrator(config(temp.path()), interrupt);
    let result = orchestrator
        .run(DownloadRequest::new(
            Url::parse(&playlist_url)?,
            temp.path().join("video.ts"),
        ))
        .await;

    assert!(result.stopped);
    assert!(result.error.is_none());
    assert_eq!(segment_requests(&server, "/hls/seg").await, 0);
    Ok(())
}

#[tokio::test]
async fn test_manifest_failure() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_status("/missing.m3u8", 404).await;

    let temp = tempfile::tempdir()?;
    let orchestrator = orchestrator(config(temp.path()), Interrupt::new());
    let result = orchestrator
        .run(DownloadRequest::new(
            Url::parse(&format!("{}/missing.m3u8", server.uri()))?,
            temp.path().join("video.ts"),
        ))
        .await;

    assert!(!result.stopped);
    assert!(result.path.is_none());
    result.error.assert_success();
    assert_eq!(orchestrator.state(), DownloadState::Failed);
    Ok(())
}

#[tokio::test]
async fn test_request_headers_are_sent() -> anyhow::Result<()> {
    use wiremock::{
        matchers::{header, method, path},
        Mock, ResponseTemplate,
    };

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hls/playlist.m3u8"))
        .and(header("x-token", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string(media_playlist(1, false)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hls/seg/0.ts"))
        .and(header("x-token", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(segment_payload(0)))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempfile::tempdir()?;
    let output = temp.path().join("video.ts");
    let orchestrator = orchestrator(config(temp.path()), Interrupt::new());
    let request = DownloadRequest::new(
        Url::parse(&format!("{}/hls/playlist.m3u8", server.uri()))?,
        &output,
    )
    .header("X-Token", "secret");
    let result = orchestrator.run(request).await;

    assert!(result.is_success(), "{result:?}");
    assert_eq!(tokio::fs::read(&output).await?, segment_payload(0));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_cenc_download_with_manual_keys() -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    use tsumugi::{key::ContentKey, DrmOptions};

    let data = include_str!("../fixtures/dash/cenc.mpd");
    let (manifest_url, server) = setup_mock_server("/dash/cenc.mpd", data).await;
    server.mock_bytes("/dash/init-video.mp4", b"<init>".to_vec()).await;
    for index in 0..2 {
        server
            .mock_bytes(&format!("/dash/seg-video-{index}.m4s"), segment_payload(index))
            .await;
    }

    let temp = tempfile::tempdir()?;
    // --key KID:KEY input output
    let tool = temp.path().join("fake-mp4decrypt");
    std::fs::write(
        &tool,
        "#!/bin/sh\n[ \"$1\" = \"--key\" ] || exit 1\n{ printf 'clear:'; cat \"$3\"; } > \"$4\"\n",
    )?;
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755))?;

    let work = temp.path().join("work");
    tokio::fs::create_dir(&work).await?;
    let config = EngineConfig {
        decrypt_tool_path: Some(tool),
        ..config(&work)
    };
    let output = temp.path().join("video.mp4");
    let keys = vec![ContentKey::parse(
        "0123456789abcdef0123456789abcdef:00112233445566778899aabbccddeeff",
    )?];
    let request = DownloadRequest::new(Url::parse(&manifest_url)?, &output).drm(DrmOptions {
        keys,
        ..Default::default()
    });

    let orchestrator = orchestrator(config, Interrupt::new());
    let result = orchestrator.run(request).await;

    assert!(result.is_success(), "{result:?}");
    let mut expected = b"clear:<init>".to_vec();
    expected.extend((0..2).flat_map(segment_payload));
    assert_eq!(tokio::fs::read(&output).await?, expected);
    Ok(())
}
