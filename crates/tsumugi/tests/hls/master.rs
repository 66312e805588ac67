use tsumugi::{
    hls::{load_playlist, parse_master_playlist},
    ResolutionPolicy, SelectionPolicy, StreamKind,
};
use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

use crate::setup_mock_server;

const MASTER: &str = include_str!("../fixtures/hls/master-playlist-with-alternative-audio.m3u8");

fn media_playlist(name: &str) -> String {
    format!(
        "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-VERSION:3
#EXTINF:4.0,
{name}-0.ts
#EXTINF:4.0,
{name}-1.ts
#EXT-X-ENDLIST"
    )
}

#[test]
fn test_parse_master_playlist() -> anyhow::Result<()> {
    let master = parse_master_playlist(MASTER, &"https://cdn.test/show/master.m3u8".parse()?)?;

    // the I-frame variant is not a candidate
    assert_eq!(master.videos.len(), 3);
    assert_eq!(master.audios.len(), 3);
    assert_eq!(
        master.videos[2].url.as_str(),
        "https://cdn.test/show/video/1080.m3u8"
    );
    assert_eq!(master.videos[2].height, Some(1080));
    assert_eq!(master.audios[1].language.as_deref(), Some("it"));
    assert_eq!(master.audio_for(&master.videos[0]).len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_only_selected_playlists_are_fetched() -> anyhow::Result<()> {
    let (master_uri, server) = setup_mock_server("/show/master.m3u8", MASTER).await;

    for (mock_path, name, expected) in [
        ("/show/video/1080.m3u8", "1080", 1),
        ("/show/video/720.m3u8", "720", 0),
        ("/show/video/480.m3u8", "480", 0),
        ("/show/audio/it.m3u8", "it", 1),
        ("/show/audio/en.m3u8", "en", 0),
        ("/show/audio/es.m3u8", "es", 0),
    ] {
        Mock::given(method("GET"))
            .and(path(mock_path))
            .respond_with(ResponseTemplate::new(200).set_body_string(media_playlist(name)))
            .expect(expected)
            .mount(&server)
            .await;
    }

    let policy = SelectionPolicy {
        resolution: ResolutionPolicy::Best,
        languages: vec!["fr".to_string(), "it".to_string()],
    };
    let loaded = load_playlist(&tsumugi::HttpClient::default(), master_uri.parse()?, &policy).await?;

    let video = &loaded.selection.video;
    assert_eq!(video.height, Some(1080));
    assert_eq!(
        video.segments[0].url.as_str(),
        format!("{}/show/video/1080-0.ts", server.uri())
    );

    let audio = loaded.selection.audio.as_ref().unwrap();
    assert_eq!(audio.kind, StreamKind::Audio);
    assert_eq!(audio.language.as_deref(), Some("it"));
    assert_eq!(
        audio.segments[1].url.as_str(),
        format!("{}/show/audio/it-1.ts", server.uri())
    );

    let kinds: Vec<_> = loaded.media_playlists.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(kinds, vec![StreamKind::Video, StreamKind::Audio]);
    Ok(())
}

#[tokio::test]
async fn test_worst_resolution() -> anyhow::Result<()> {
    let (master_uri, server) = setup_mock_server("/show/master.m3u8", MASTER).await;
    for (mock_path, name) in [
        ("/show/video/480.m3u8", "480"),
        ("/show/audio/en.m3u8", "en"),
        ("/show/audio/it.m3u8", "it"),
        ("/show/audio/es.m3u8", "es"),
    ] {
        Mock::given(method("GET"))
            .and(path(mock_path))
            .respond_with(ResponseTemplate::new(200).set_body_string(media_playlist(name)))
            .mount(&server)
            .await;
    }

    let policy = SelectionPolicy {
        resolution: ResolutionPolicy::Worst,
        languages: Vec::new(),
    };
    let loaded = load_playlist(&tsumugi::HttpClient::default(), master_uri.parse()?, &policy).await?;
    assert_eq!(loaded.selection.video.height, Some(480));
    assert!(loaded.selection.audio.is_some());
    Ok(())
}
