//! Streaming consumer example using the FluxMQ session core

use fluxmq_session::*;
use std::time::Duration;
use tokio::sync::mpsc;

const TOPIC: &str = "rust-sdk-topic";
const GROUP: &str = "rust-sdk-consumer-group";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("📖 FluxMQ Session - Stream Consumer Example");
    println!("============================================");

    let config = match SessionConfig::from_env() {
        Ok(config) if config.consumer_group.is_group() => config,
        _ => SessionConfigBuilder::new()
            .brokers(vec!["localhost:9092"])
            .client_id("stream-consumer-example")
            .consumer_group(GROUP)
            .build(),
    };
    let session = Session::start(config)?;

    let metadata = session.metadata().await?;
    let partitions: Vec<i32> = metadata
        .partitions()
        .filter(|(tp, _)| tp.topic == TOPIC)
        .map(|(tp, _)| tp.partition)
        .collect();
    println!(
        "✅ Cluster metadata: {} brokers, {} partitions of {}",
        metadata.brokers().len(),
        partitions.len(),
        TOPIC
    );

    // Example 1: group membership round trips
    println!("\n👥 Example 1: Joining {}", GROUP);
    let join = match session
        .join_group(vec![TOPIC.to_string()], Duration::from_secs(30))
        .await?
    {
        Outcome::Completed(join) => join,
        Outcome::TopicNotFound => {
            println!("   ❌ No coordinator available for {}", GROUP);
            return Ok(());
        }
    };
    println!(
        "   Member {} in generation {} (leader: {})",
        join.member_id,
        join.generation_id,
        join.is_leader()
    );

    // The leader takes every partition for itself in this example
    let assignments = if join.is_leader() {
        vec![MemberAssignment {
            member_id: join.member_id.clone(),
            topics: vec![TopicAssignment::new(TOPIC, partitions)],
        }]
    } else {
        Vec::new()
    };
    if let Some(sync) = session
        .sync_group(GROUP, join.generation_id, join.member_id.clone(), assignments)
        .await?
        .completed()
    {
        for assignment in &sync.assignments {
            println!(
                "   Assigned {} partitions {:?}",
                assignment.topic, assignment.partitions
            );
        }
    }

    // Example 2: resume from the committed offset
    println!("\n📖 Example 2: Streaming {}-0", TOPIC);
    let committed = session
        .offset_fetch(OffsetFetchRequest::new(TOPIC, 0))
        .await?
        .completed()
        .and_then(|response| response.offset(TOPIC, 0))
        .unwrap_or(-1);
    println!("   Committed offset: {}", committed);

    let (sink, mut records) = mpsc::unbounded_channel();
    session.start_streaming(
        FetchCursor::new(TOPIC, 0, committed + 1).with_auto_commit(true),
        sink,
    )?;

    let mut received = 0;
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            record = records.recv() => {
                let Some(record) = record else { break };
                received += 1;
                let key_str = record
                    .key
                    .as_ref()
                    .map(|k| String::from_utf8_lossy(k).to_string())
                    .unwrap_or_else(|| "<no key>".to_string());
                let value_str = record
                    .value
                    .as_ref()
                    .map(|v| String::from_utf8_lossy(v).to_string())
                    .unwrap_or_default();

                println!(
                    "   Record {}: partition={}, offset={}, key='{}', value='{}'",
                    received, record.partition, record.offset, key_str, value_str
                );

                if received >= 20 {
                    break;
                }
            }
            _ = &mut deadline => {
                println!("   ⏰ Timeout reached");
                break;
            }
        }
    }

    session.stop_streaming()?;

    if let Some(heartbeat) = session
        .heartbeat(GROUP, join.generation_id, join.member_id.clone())
        .await?
        .completed()
    {
        println!("\n💓 Heartbeat: {}", heartbeat.error_code);
    }
    session.leave_group(GROUP, join.member_id).await?;

    println!(
        "\n✅ Consumer example completed! Received {} records",
        received
    );

    Ok(())
}
