mod common;

use common::*;
use ratewarden::{with_reason, CallContext, Method, ReasonPrecedence, RequestError, Route};
use std::time::Duration;

fn member(guild: u64, user: u64) -> Route {
    Route::builder(Method::Delete, "/guilds/{guild_id}/members/{user_id}")
        .major("guild_id", guild)
        .param("user_id", user)
        .build()
        .unwrap()
}

fn reason_of(transport: &ScriptedTransport, path: &str) -> Option<String> {
    transport.sent_to(path)[0].headers.get("X-Audit-Log-Reason").map(str::to_owned)
}

#[tokio::test(start_paused = true)]
async fn each_request_carries_the_reason_it_was_submitted_under() {
    let transport = ScriptedTransport::new();
    transport.slow("/guilds/1/members/1", Duration::from_millis(200), ok());
    let dispatcher = dispatcher(&transport);

    let a = with_reason("A", async { dispatcher.request(member(1, 1)).submit() }).await;
    let b = with_reason("B", async { dispatcher.request(member(2, 2)).submit() }).await;
    let none = dispatcher.request(member(3, 3)).submit();
    a.await.unwrap();
    b.await.unwrap();
    none.await.unwrap();

    assert_eq!(reason_of(&transport, "/guilds/1/members/1").as_deref(), Some("A"));
    assert_eq!(reason_of(&transport, "/guilds/2/members/2").as_deref(), Some("B"));
    assert_eq!(reason_of(&transport, "/guilds/3/members/3"), None);
}

#[tokio::test(start_paused = true)]
async fn reasons_are_percent_encoded() {
    let transport = ScriptedTransport::new();
    let dispatcher = dispatcher(&transport);

    with_reason("spam cleanup: ünïcode", dispatcher.request(member(1, 1)).complete()).await.unwrap();
    assert_eq!(
        reason_of(&transport, "/guilds/1/members/1").as_deref(),
        Some("spam%20cleanup%3A%20%C3%BCn%C3%AFcode")
    );
}

#[tokio::test(start_paused = true)]
async fn raw_reasons_when_encoding_is_off() {
    let transport = ScriptedTransport::new();
    let dispatcher = dispatcher_with(&transport, config().encode_reason(false).reason_header("X-Reason"));

    with_reason("plain text", dispatcher.request(member(1, 1)).complete()).await.unwrap();
    assert_eq!(transport.sent()[0].headers.get("x-reason"), Some("plain text"));
}

#[tokio::test(start_paused = true)]
async fn explicit_reason_wins_by_default() {
    let transport = ScriptedTransport::new();
    let dispatcher = dispatcher(&transport);

    with_reason("ambient", dispatcher.request(member(1, 1)).reason("explicit").complete()).await.unwrap();
    assert_eq!(reason_of(&transport, "/guilds/1/members/1").as_deref(), Some("explicit"));
}

#[tokio::test(start_paused = true)]
async fn ambient_reason_can_take_precedence() {
    let transport = ScriptedTransport::new();
    let dispatcher =
        dispatcher_with(&transport, config().reason_precedence(ReasonPrecedence::AmbientFirst));

    with_reason("ambient", dispatcher.request(member(1, 1)).reason("explicit").complete()).await.unwrap();
    dispatcher.request(member(2, 2)).reason("explicit").complete().await.unwrap();
    assert_eq!(reason_of(&transport, "/guilds/1/members/1").as_deref(), Some("ambient"));
    assert_eq!(reason_of(&transport, "/guilds/2/members/2").as_deref(), Some("explicit"));
}

#[tokio::test(start_paused = true)]
async fn continuations_run_under_the_submitting_context() {
    let transport = ScriptedTransport::new();
    let dispatcher = dispatcher(&transport);

    let in_map = with_reason("A", async {
        dispatcher
            .request(member(1, 2))
            .map(|_| CallContext::current().reason().map(str::to_owned))
            .submit()
    })
    .await;
    // awaited under another reason; the continuation still sees its own
    let seen = with_reason("B", in_map.await_result()).await.unwrap();
    assert_eq!(seen.as_deref(), Some("A"));

    let hooked = std::sync::Arc::new(std::sync::Mutex::new(None));
    let slot = hooked.clone();
    with_reason(
        "C",
        dispatcher
            .request(member(1, 3))
            .on_success(move |_| *slot.lock().unwrap() = CallContext::current().reason().map(str::to_owned))
            .complete(),
    )
    .await
    .unwrap();
    assert_eq!(hooked.lock().unwrap().as_deref(), Some("C"));
}

#[tokio::test(start_paused = true)]
async fn chained_requests_inherit_the_reason() {
    let transport = ScriptedTransport::new();
    let dispatcher = dispatcher(&transport);

    let follow_up = dispatcher.clone();
    let chained = with_reason("moderation", async {
        dispatcher
            .request(member(1, 1))
            .and_then(move |_| follow_up.request(member(9, 9)).complete())
            .submit()
    })
    .await;
    chained.await.unwrap();

    assert_eq!(reason_of(&transport, "/guilds/9/members/9").as_deref(), Some("moderation"));
}

#[cfg(debug_assertions)]
#[tokio::test(start_paused = true)]
async fn blocking_wait_inside_a_continuation_is_refused() {
    let transport = ScriptedTransport::new();
    let dispatcher = dispatcher(&transport);

    let follow_up = dispatcher.clone();
    let result = dispatcher
        .request(member(1, 1))
        .and_then(move |_| async move { follow_up.request(member(2, 2)).submit().wait_blocking() })
        .complete()
        .await;
    assert!(matches!(result, Err(RequestError::BlockingInDispatch)));
}

#[cfg(debug_assertions)]
#[tokio::test(start_paused = true)]
async fn blocking_wait_inside_a_precheck_is_refused() {
    let transport = ScriptedTransport::new();
    let dispatcher = dispatcher(&transport);
    let seen = std::sync::Arc::new(std::sync::Mutex::new(None));

    let (slot, follow_up) = (seen.clone(), dispatcher.clone());
    dispatcher
        .request(member(1, 1))
        .check(move || {
            let waited = follow_up.request(member(2, 2)).submit().wait_blocking();
            *slot.lock().unwrap() = Some(matches!(waited, Err(RequestError::BlockingInDispatch)));
            true
        })
        .complete()
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(true));
}
