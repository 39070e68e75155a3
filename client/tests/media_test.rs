//! Camera and screen-share integration tests.
//!
//! Run with: `cargo test --test media_test`

mod helpers;

use helpers::*;
use vc_mesh::media::{MediaError, TrackKind, TrackSource};
use vc_mesh::rtc::RtpSender;
use vc_mesh::{LocalBus, SessionError};
use vc_mesh_common::protocol::{PresenceMessage, RoomTopics, SdpKind, SignalMessage};
use vc_mesh_common::{StateUpdate, UserId};

/// Client 5 in room R, linked to remote 9 (which offers).
async fn joined_with_peer(bus: &LocalBus) -> (TestClient, RoomTopics) {
    let t = topics("R");
    let client = TestClient::join_room(5, bus, "R").await;

    inject_presence(bus, &t, PresenceMessage::Join { participant: participant(9) }).await;
    inject_signal(
        bus,
        &t,
        SignalMessage::description(SdpKind::Offer, UserId(9), UserId(5), "offer 9->5".into()),
    )
    .await;
    client
        .wait_for("stream from 9", |s| s.stream(UserId(9)).is_some())
        .await;
    (client, t)
}

fn state_updates(client: &TestClient, t: &RoomTopics) -> Vec<StateUpdate> {
    client
        .bus
        .states_sent(t)
        .iter()
        .filter_map(|m| m.state_update())
        .collect()
}

// ============================================================================
// Camera
// ============================================================================

#[tokio::test]
async fn test_camera_toggle_reuses_the_joined_track() {
    let bus = LocalBus::new();
    let (client, t) = joined_with_peer(&bus).await;
    let camera = client.devices.camera().unwrap();
    let link = client.peers.connections_to(UserId(9))[0].clone();

    assert!(client.session.toggle_camera().await.unwrap());
    let snapshot = client.session.snapshot();
    assert!(snapshot.local.cam_on);
    assert_eq!(snapshot.local_video.as_ref().map(|v| v.id()), Some(camera.id()));
    assert!(camera.is_enabled());
    assert_eq!(link.video_track_id().as_deref(), Some(camera.id()));

    assert!(!client.session.toggle_camera().await.unwrap());
    let snapshot = client.session.snapshot();
    assert!(!snapshot.local.cam_on);
    assert!(snapshot.local_video.is_none());
    assert!(!camera.is_enabled());
    assert!(!camera.is_stopped());

    assert_eq!(client.devices.user_media_calls(), 1);
    assert_eq!(
        state_updates(&client, &t),
        vec![StateUpdate::camera(true), StateUpdate::camera(false)]
    );
}

#[tokio::test]
async fn test_camera_acquired_later_after_audio_only_join() {
    let bus = LocalBus::new();
    let t = topics("R");
    let client = TestClient::new(5, &bus);
    client.devices.set_camera_available(false);
    client.session.join("R").await.unwrap();

    inject_presence(&bus, &t, PresenceMessage::Join { participant: participant(9) }).await;
    eventually("link to 9", || client.peers.connections_to(UserId(9)).len() == 1).await;
    let link = client.peers.connections_to(UserId(9))[0].clone();
    assert!(link.video_track_id().is_none());

    client.devices.set_camera_available(true);
    assert!(client.session.toggle_camera().await.unwrap());

    let camera = client.devices.camera().unwrap();
    assert!(camera.is_enabled());
    assert_eq!(link.video_track_id().as_deref(), Some(camera.id()));
    assert!(client.session.snapshot().local.cam_on);
    assert_eq!(state_updates(&client, &t), vec![StateUpdate::camera(true)]);
}

#[tokio::test]
async fn test_camera_acquisition_failure_keeps_camera_off() {
    let bus = LocalBus::new();
    let t = topics("R");
    let client = TestClient::new(5, &bus);
    client.devices.set_camera_available(false);
    client.session.join("R").await.unwrap();

    let err = client.session.toggle_camera().await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::MediaAcquisitionFailed(MediaError::NoDevice(_))
    ));
    assert!(!client.session.snapshot().local.cam_on);
    assert!(state_updates(&client, &t).is_empty());
}

#[tokio::test]
async fn test_leave_during_camera_prompt_cancels_it() {
    let bus = LocalBus::new();
    let client = TestClient::new(5, &bus);
    client.devices.set_camera_available(false);
    client.session.join("R").await.unwrap();
    client.devices.set_camera_available(true);
    client.devices.hold();

    let session = client.session.clone();
    let toggle = tokio::spawn(async move { session.toggle_camera().await });
    eventually("camera prompt open", || client.devices.user_media_calls() == 3).await;

    client.session.leave().await;
    client.devices.release();

    assert!(matches!(toggle.await.unwrap(), Err(SessionError::Cancelled)));
    eventually("late camera released", || {
        client.devices.camera().is_some_and(|c| c.is_stopped())
    })
    .await;
}

// ============================================================================
// Screen share
// ============================================================================

#[tokio::test]
async fn test_screen_share_replaces_video_on_every_link() {
    let bus = LocalBus::new();
    let (client, t) = joined_with_peer(&bus).await;
    inject_presence(&bus, &t, PresenceMessage::Join { participant: participant(12) }).await;
    eventually("link to 12", || client.peers.connections_to(UserId(12)).len() == 1).await;
    assert!(client.session.toggle_camera().await.unwrap());
    let camera = client.devices.camera().unwrap();

    assert!(client.session.toggle_screen_share().await.unwrap());

    let screen = client.devices.last_screen().unwrap();
    let links = client.peers.open_connections();
    assert_eq!(links.len(), 2);
    for link in &links {
        assert_eq!(link.video_track_id().as_deref(), Some(screen.id()));
        assert_ne!(link.video_track_id().as_deref(), Some(camera.id()));
    }

    let snapshot = client.session.snapshot();
    assert!(snapshot.local.screen_on);
    assert!(snapshot.local.cam_on);
    assert_eq!(snapshot.local_video.as_ref().map(|v| v.id()), Some(screen.id()));
    assert_eq!(client.devices.issued_of(TrackSource::ScreenAudio).len(), 0);
}

#[tokio::test]
async fn test_stop_restores_camera_when_it_was_on() {
    let bus = LocalBus::new();
    let (client, t) = joined_with_peer(&bus).await;
    let link = client.peers.connections_to(UserId(9))[0].clone();
    assert!(client.session.toggle_camera().await.unwrap());
    let camera = client.devices.camera().unwrap();

    assert!(client.session.toggle_screen_share().await.unwrap());
    assert!(!client.session.toggle_screen_share().await.unwrap());

    let screen = client.devices.last_screen().unwrap();
    assert!(screen.is_stopped());
    assert_eq!(link.video_track_id().as_deref(), Some(camera.id()));
    assert!(camera.is_enabled());
    assert!(!client.session.snapshot().local.screen_on);
    assert_eq!(
        state_updates(&client, &t),
        vec![
            StateUpdate::camera(true),
            StateUpdate::screen(true),
            StateUpdate::screen(false)
        ]
    );
}

#[tokio::test]
async fn test_stop_with_camera_off_sends_no_active_video() {
    let bus = LocalBus::new();
    let (client, _) = joined_with_peer(&bus).await;
    let link = client.peers.connections_to(UserId(9))[0].clone();

    assert!(client.session.toggle_screen_share().await.unwrap());
    assert!(!client.session.toggle_screen_share().await.unwrap());

    let video = link.sender(TrackKind::Video).unwrap();
    assert!(video.track().map_or(true, |t| !t.is_enabled()));
    assert!(client.session.snapshot().local_video.is_none());
}

#[tokio::test]
async fn test_native_stop_matches_direct_stop() {
    let bus = LocalBus::new();
    let (client, t) = joined_with_peer(&bus).await;
    let link = client.peers.connections_to(UserId(9))[0].clone();
    assert!(client.session.toggle_camera().await.unwrap());
    let camera = client.devices.camera().unwrap();
    assert!(client.session.toggle_screen_share().await.unwrap());
    let screen = client.devices.last_screen().unwrap();

    screen.end();

    let snapshot = client
        .wait_for("screen share ended", |s| !s.local.screen_on)
        .await;
    assert!(snapshot.local.cam_on);
    assert_eq!(snapshot.local_video.as_ref().map(|v| v.id()), Some(camera.id()));
    assert!(screen.is_stopped());
    assert_eq!(link.video_track_id().as_deref(), Some(camera.id()));
    assert_eq!(
        state_updates(&client, &t).last(),
        Some(&StateUpdate::screen(false))
    );

    // A fresh share works after the system stopped the last one.
    assert!(client.session.toggle_screen_share().await.unwrap());
    assert_eq!(client.devices.display_calls(), 2);
}

#[tokio::test]
async fn test_end_of_an_old_capture_is_ignored() {
    let bus = LocalBus::new();
    let (client, t) = joined_with_peer(&bus).await;

    assert!(client.session.toggle_screen_share().await.unwrap());
    let first = client.devices.last_screen().unwrap();
    assert!(!client.session.toggle_screen_share().await.unwrap());
    assert!(client.session.toggle_screen_share().await.unwrap());

    first.end();
    settle().await;

    assert!(client.session.snapshot().local.screen_on);
    assert_eq!(
        state_updates(&client, &t).last(),
        Some(&StateUpdate::screen(true))
    );
}

#[tokio::test]
async fn test_camera_toggle_while_sharing_keeps_screen_outbound() {
    let bus = LocalBus::new();
    let (client, _) = joined_with_peer(&bus).await;
    let link = client.peers.connections_to(UserId(9))[0].clone();

    assert!(client.session.toggle_screen_share().await.unwrap());
    let screen = client.devices.last_screen().unwrap();
    assert!(client.session.toggle_camera().await.unwrap());

    assert_eq!(link.video_track_id().as_deref(), Some(screen.id()));

    assert!(!client.session.toggle_screen_share().await.unwrap());
    let camera = client.devices.camera().unwrap();
    assert_eq!(link.video_track_id().as_deref(), Some(camera.id()));
    assert!(camera.is_enabled());
}

#[tokio::test]
async fn test_cancelled_screen_prompt_changes_nothing() {
    let bus = LocalBus::new();
    let (client, t) = joined_with_peer(&bus).await;
    client.devices.set_screen_error(Some(MediaError::Cancelled));

    assert!(!client.session.toggle_screen_share().await.unwrap());

    assert!(!client.session.snapshot().local.screen_on);
    assert!(state_updates(&client, &t).is_empty());
}

#[tokio::test]
async fn test_denied_screen_capture_fails() {
    let bus = LocalBus::new();
    let (client, _) = joined_with_peer(&bus).await;
    client
        .devices
        .set_screen_error(Some(MediaError::PermissionDenied));

    let err = client.session.toggle_screen_share().await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::MediaAcquisitionFailed(MediaError::PermissionDenied)
    ));
    assert!(!client.session.snapshot().local.screen_on);
}

#[tokio::test]
async fn test_second_prompt_while_one_is_open_is_rejected() {
    let bus = LocalBus::new();
    let (client, _) = joined_with_peer(&bus).await;
    client.devices.hold();

    let session = client.session.clone();
    let first = tokio::spawn(async move { session.toggle_screen_share().await });
    eventually("screen prompt open", || client.devices.display_calls() == 1).await;

    assert!(matches!(
        client.session.toggle_screen_share().await,
        Err(SessionError::DevicePromptPending)
    ));
    assert!(matches!(
        client.session.toggle_camera().await,
        Ok(true)
    ));

    client.devices.release();
    assert!(first.await.unwrap().unwrap());
    assert!(client.session.snapshot().local.screen_on);
}

#[tokio::test]
async fn test_leave_during_screen_prompt_releases_late_capture() {
    let bus = LocalBus::new();
    let (client, _) = joined_with_peer(&bus).await;
    client.devices.hold();

    let session = client.session.clone();
    let toggle = tokio::spawn(async move { session.toggle_screen_share().await });
    eventually("screen prompt open", || client.devices.display_calls() == 1).await;

    client.session.leave().await;
    client.devices.release();

    assert!(matches!(toggle.await.unwrap(), Err(SessionError::Cancelled)));
    eventually("late screen released", || {
        client.devices.last_screen().is_some_and(|s| s.is_stopped())
    })
    .await;
    assert!(client.peers.open_connections().is_empty());
}
