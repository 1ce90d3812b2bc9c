//! Full-conversation tests: one session, one folder, one date.

#![allow(clippy::unwrap_used)]

use chrono::NaiveDate;
use certvault_imap::{Error, FolderFetch, RetryPolicy, Session, SessionConfig, with_retry};
use tokio_test::io::Builder;

fn config() -> SessionConfig {
    SessionConfig::new("imaps.pec.aruba.it", 993).credentials("a@pec.it", "secret")
}

fn target_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
}

/// One complete archival conversation: greeting, login, examine, search,
/// one fetch batch, logout.
#[tokio::test]
async fn full_day_fetch_conversation() {
    let mock = Builder::new()
        .read(b"* OK aruba PEC IMAP ready\r\n")
        .write(b"A001 LOGIN \"a@pec.it\" \"secret\"\r\n")
        .read(b"A001 OK LOGIN completed\r\n")
        .write(b"A002 EXAMINE \"INBOX\"\r\n")
        .read(b"* 3 EXISTS\r\n")
        .read(b"A002 OK [READ-ONLY] EXAMINE completed\r\n")
        .write(b"A003 UID SEARCH ON 15-Jan-2024\r\n")
        .read(b"* SEARCH 10 11 12\r\n")
        .read(b"A003 OK SEARCH completed\r\n")
        .write(b"A004 UID FETCH 10,11,12 (UID RFC822)\r\n")
        .read(b"* 1 FETCH (UID 10 RFC822 {20}\r\nSubject: uno\r\n\r\nb1\r\n)\r\n")
        .read(b"* 2 FETCH (UID 11 RFC822 {20}\r\nSubject: due\r\n\r\nb2\r\n)\r\n")
        .read(b"* 3 FETCH (UID 12 RFC822 {20}\r\nSubject: tre\r\n\r\nb3\r\n)\r\n")
        .read(b"A004 OK FETCH completed\r\n")
        .write(b"A005 LOGOUT\r\n")
        .read(b"* BYE logging out\r\n")
        .read(b"A005 OK LOGOUT completed\r\n")
        .build();

    let mut session = Session::from_stream(mock, &config()).await.unwrap();

    let mut fetch = FolderFetch::start(&mut session, "INBOX", target_date(), 100)
        .await
        .unwrap();

    let mut uids = Vec::new();
    while let Some(message) = fetch.next().await.unwrap() {
        assert_eq!(message.raw.len(), 20);
        uids.push(message.uid.get());
    }
    assert_eq!(uids, vec![10, 11, 12]);

    session.logout().await.unwrap();
}

/// A connection cut mid-folder surfaces a transient error; messages
/// yielded before the cut remain usable.
#[tokio::test]
async fn connection_drop_mid_fetch_is_transient() {
    let mock = Builder::new()
        .read(b"* OK ready\r\n")
        .write(b"A001 LOGIN \"a@pec.it\" \"secret\"\r\n")
        .read(b"A001 OK LOGIN completed\r\n")
        .write(b"A002 EXAMINE \"INBOX\"\r\n")
        .read(b"* 3 EXISTS\r\nA002 OK done\r\n")
        .write(b"A003 UID SEARCH ON 15-Jan-2024\r\n")
        .read(b"* SEARCH 10 11 12\r\nA003 OK done\r\n")
        .write(b"A004 UID FETCH 10,11 (UID RFC822)\r\n")
        .read(b"* 1 FETCH (UID 10 RFC822 {2}\r\nb1)\r\n")
        .read(b"* 2 FETCH (UID 11 RFC822 {2}\r\nb2)\r\n")
        .read(b"A004 OK done\r\n")
        .write(b"A005 UID FETCH 12 (UID RFC822)\r\n")
        .read_error(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))
        .build();

    let mut session = Session::from_stream(mock, &config()).await.unwrap();
    let mut fetch = FolderFetch::start(&mut session, "INBOX", target_date(), 2)
        .await
        .unwrap();

    let first = fetch.next().await.unwrap().unwrap();
    let second = fetch.next().await.unwrap().unwrap();
    assert_eq!((first.uid.get(), second.uid.get()), (10, 11));

    let err = fetch.next().await.unwrap_err();
    assert!(err.is_transient());
}

/// Reconnect-with-backoff around session establishment: two refused
/// greetings, then success.
#[tokio::test(start_paused = true)]
async fn connect_retry_recovers_after_transient_failures() {
    let mut scripts = std::collections::VecDeque::from([
        Builder::new().read(b"* BYE maintenance\r\n").build(),
        Builder::new().read(b"* BYE maintenance\r\n").build(),
        Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A001 LOGIN \"a@pec.it\" \"secret\"\r\n")
            .read(b"A001 OK LOGIN completed\r\n")
            .build(),
    ]);

    let config = config();
    let policy = RetryPolicy::default();
    let started = tokio::time::Instant::now();

    let session = with_retry(&policy, || {
        let stream = scripts.pop_front();
        let config = config.clone();
        async move {
            match stream {
                Some(stream) => Session::from_stream(stream, &config).await,
                None => Err(Error::InvalidState("no more scripted connections".into())),
            }
        }
    })
    .await;

    assert!(session.is_ok());
    // Two transient failures cost 5s + 10s of backoff.
    assert_eq!(started.elapsed().as_secs(), 15);
}
