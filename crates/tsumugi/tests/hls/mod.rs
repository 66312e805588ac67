mod master;

use tsumugi::{
    hls::{load_playlist, parse_media_playlist, HlsVariant},
    EncryptionContext, EncryptionMethod, HttpClient, SelectionPolicy, StreamKind, TsumugiError,
};

use crate::{setup_mock_server, AssertWrapper, SegmentMock};

#[tokio::test]
async fn test_simple_media_playlist() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/hls/simple-media-playlist.m3u8");
    let (playlist_uri, _server) = setup_mock_server("/playlist.m3u8", data).await;

    let client = HttpClient::default();
    let loaded = load_playlist(&client, playlist_uri.parse()?, &SelectionPolicy::default()).await?;

    let video = loaded.selection.video;
    assert!(loaded.selection.audio.is_none());
    assert_eq!(video.kind, StreamKind::Video);
    assert_eq!(video.encryption, EncryptionContext::None);
    assert!(video.init.is_none());
    assert_eq!(video.extension(), "ts");

    let urls: Vec<_> = video.segments.iter().map(|s| s.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "http://media.example.com/first.ts",
            "http://media.example.com/second.ts",
            "http://media.example.com/third.ts",
        ]
    );
    let indices: Vec<_> = video.segments.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    let duration = video.duration.assert_success().as_secs_f64();
    assert!((duration - 21.021).abs() < 0.01);

    assert_eq!(loaded.media_playlists, vec![(StreamKind::Video, data.to_string())]);
    Ok(())
}

#[tokio::test]
async fn test_encrypted_media_playlist() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/hls/encrypted-media-playlist.m3u8");
    let (playlist_uri, server) = setup_mock_server("/live/playlist.m3u8", data).await;
    server.mock_bytes("/live/key.bin", (0u8..16).collect()).await;

    let client = HttpClient::default();
    let loaded = load_playlist(&client, playlist_uri.parse()?, &SelectionPolicy::default()).await?;
    let video = loaded.selection.video;

    let mut expected_key = [0u8; 16];
    for (i, byte) in expected_key.iter_mut().enumerate() {
        *byte = i as u8;
    }
    assert_eq!(
        video.encryption,
        EncryptionContext::Aes {
            method: EncryptionMethod::Cbc,
            key: expected_key,
            iv: None,
        }
    );

    let sequences: Vec<_> = video.segments.iter().map(|s| s.sequence).collect();
    assert_eq!(sequences, vec![7794, 7795, 7796]);
    assert_eq!(
        video.segments[0].url.as_str(),
        format!("{}/live/segment-7794.ts", server.uri())
    );
    Ok(())
}

#[tokio::test]
async fn test_key_fetch_failure_fails_parse() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/hls/encrypted-media-playlist.m3u8");
    let (playlist_uri, server) = setup_mock_server("/live/playlist.m3u8", data).await;
    server.mock_status("/live/key.bin", 403).await;

    let client = HttpClient::default();
    let result = load_playlist(&client, playlist_uri.parse()?, &SelectionPolicy::default()).await;
    assert!(matches!(result, Err(TsumugiError::ManifestError(_))));
    Ok(())
}

#[tokio::test]
async fn test_unreachable_playlist_is_manifest_error() -> anyhow::Result<()> {
    let (_, server) = setup_mock_server("/playlist.m3u8", "").await;
    server.mock_status("/missing.m3u8", 404).await;

    let client = HttpClient::default();
    let url = format!("{}/missing.m3u8", server.uri()).parse()?;
    load_playlist(&client, url, &SelectionPolicy::default())
        .await
        .assert_error();
    Ok(())
}

#[tokio::test]
async fn test_byterange_media_playlist() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/hls/byterange-media-playlist.m3u8");
    let variant = HlsVariant::standalone("https://cdn.test/vod/playlist.m3u8".parse()?);

    let video = parse_media_playlist(&HttpClient::default(), data, &variant).await?;

    let init = video.init.as_ref().assert_success();
    assert_eq!(init.url.as_str(), "https://cdn.test/vod/init.mp4");
    assert_eq!(init.byte_range, Some(tsumugi::ByteRange::new(0, Some(720))));

    let ranges: Vec<_> = video
        .segments
        .iter()
        .map(|s| s.byte_range.map(|r| (r.offset, r.length)))
        .collect();
    assert_eq!(
        ranges,
        vec![
            Some((720, Some(75232))),
            Some((75952, Some(82112))),
            Some((158064, Some(69864))),
        ]
    );
    assert_eq!(video.extension(), "mp4");
    Ok(())
}

#[tokio::test]
async fn test_parse_is_idempotent() -> anyhow::Result<()> {
    let data = include_str!("../fixtures/hls/byterange-media-playlist.m3u8");
    let variant = HlsVariant::standalone("https://cdn.test/vod/playlist.m3u8".parse()?);
    let client = HttpClient::default();

    let first = parse_media_playlist(&client, data, &variant).await?;
    let second = parse_media_playlist(&client, data, &variant).await?;
    assert_eq!(first, second);
    Ok(())
}
