use serde::Deserialize;
use tokio::sync::mpsc;
use weir::decode::JsonDecoder;
use weir::error::Error;
use weir::pipeline::Pipeline;
use weir::record::Record;
use weir::stages::{RecordsSource, Select};

mod common;
use common::collect_decoded;

#[derive(Deserialize, Clone, Debug, PartialEq)]
struct Obj {
    n: i64,
}

async fn decode_payloads<T>(decoder: JsonDecoder<T>, payloads: Vec<Record>) -> Vec<T>
where
    T: serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    let job = Pipeline::new()
        .then(RecordsSource::from_records(payloads))
        .then(decoder)
        .stream_to(tx)
        .build();
    let collected = tokio::spawn(collect_decoded::<T>(rx));
    job.run().await.expect("clean run");
    collected.await.expect("drain task")
}

#[tokio::test]
async fn concatenated_objects_decode_in_file_order() {
    let values = decode_payloads(
        JsonDecoder::<Obj>::new().decoders(1),
        vec![Record::from(r#"{"n":1}{"n":2} {"n":3}{"n":4}"#)],
    )
    .await;
    assert_eq!(
        values,
        vec![Obj { n: 1 }, Obj { n: 2 }, Obj { n: 3 }, Obj { n: 4 }]
    );
}

#[tokio::test]
async fn star_selector_yields_each_array_element() {
    let values = decode_payloads(
        JsonDecoder::<i64>::new().decoders(1).selector("a.b.*"),
        vec![Record::from(r#"{"a":{"b":[1,2,3]}}"#)],
    )
    .await;
    assert_eq!(values, vec![1, 2, 3]);
}

#[tokio::test]
async fn whole_array_selector_yields_a_single_list() {
    let values = decode_payloads(
        JsonDecoder::<Vec<i64>>::new().decoders(1).selector("a.b"),
        vec![Record::from(r#"{"a":{"b":[1,2,3]}}"#)],
    )
    .await;
    assert_eq!(values, vec![vec![1, 2, 3]]);
}

#[tokio::test]
async fn undecodable_values_are_skipped_by_default() {
    let (tx, rx) = mpsc::channel(64);
    let job = Pipeline::new()
        .then(RecordsSource::from_value(r#"{"n":1}{"n":"bad"}{"n":3}"#))
        .then(JsonDecoder::<Obj>::new().decoders(1))
        .stream_to(tx)
        .build();
    let collected = tokio::spawn(collect_decoded::<Obj>(rx));
    job.run().await.expect("bad value is skipped, not fatal");

    assert_eq!(
        collected.await.expect("drain task"),
        vec![Obj { n: 1 }, Obj { n: 3 }]
    );
    assert!(job.error().is_none());
}

#[tokio::test]
async fn abort_on_failed_value_fails_the_pipeline() {
    let (tx, rx) = mpsc::channel(64);
    let job = Pipeline::new()
        .then(RecordsSource::from_value(r#"{"n":1}{"n":"bad"}{"n":3}"#))
        .then(
            JsonDecoder::<Obj>::new()
                .decoders(1)
                .abort_on_failed_value(true),
        )
        .stream_to(tx)
        .build();
    let drained = tokio::spawn(collect_decoded::<Obj>(rx));

    let err = job.run().await.expect_err("bad value is fatal");
    assert!(matches!(err, Error::Decode(_)));
    drained.await.expect("drain task");
}

#[tokio::test]
async fn select_marker_configures_the_decoder_selector() {
    // Without a selector the top-level object does not decode as i64 and is
    // skipped, so the run yields nothing.
    let values = decode_payloads::<i64>(
        JsonDecoder::<i64>::new().decoders(1),
        vec![Record::from(r#"{"a":{"b":[7,8]}}"#)],
    )
    .await;
    assert!(values.is_empty());

    let (tx, rx) = mpsc::channel(64);
    let job = Pipeline::new()
        .then(RecordsSource::from_value(r#"{"a":{"b":[7,8]}}"#))
        .then(JsonDecoder::<i64>::new().decoders(1))
        .then(Select::new(["a.b.*"]))
        .stream_to(tx)
        .build();
    let collected = tokio::spawn(collect_decoded::<i64>(rx));
    job.run().await.expect("clean run");
    assert_eq!(collected.await.expect("drain task"), vec![7, 8]);
}

#[tokio::test]
async fn values_from_concurrent_payloads_all_arrive() {
    let mut values = decode_payloads(
        JsonDecoder::<Obj>::new().decoders(2),
        vec![
            Record::from(r#"{"n":1}{"n":2}"#),
            Record::from(r#"{"n":3}{"n":4}"#),
        ],
    )
    .await;
    values.sort_by_key(|o| o.n);
    assert_eq!(
        values,
        vec![Obj { n: 1 }, Obj { n: 2 }, Obj { n: 3 }, Obj { n: 4 }]
    );
}
