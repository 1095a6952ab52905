//! Loopback demo for ros-sensor-link
//!
//! Feeds synthetic voxblox mesh messages through an in-memory bridge link and
//! prints the mesh that builds up on the consumer side.

use ros_sensor_link::codec::encode_delta;
use ros_sensor_link::loopback::loopback;
use ros_sensor_link::{BlockKey, MeshBlock, MeshDelta, MeshMap, SensorConnection, WorkerConfig};
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let (connector, bridge) = loopback();
    let mut sensor = SensorConnection::new(connector, WorkerConfig::default());
    let report = sensor.initialize("demo", "localhost", 9090, &["mesh"])?;
    println!("Subscribed to {:?}", report.topics);

    // Grow a row of blocks, then carve one out again
    for step in 0..5i64 {
        let mut delta = MeshDelta {
            block_edge_length: 0.5,
            ..Default::default()
        };
        let key = BlockKey::new(step, 0, 0);
        let origin = step as f32 * 0.5;
        delta.blocks.insert(
            key,
            MeshBlock {
                positions: vec![
                    [origin, 0.0, 0.0],
                    [origin + 0.25, 0.0, 0.0],
                    [origin, 0.25, 0.0],
                ],
                indices: vec![0, 1, 2],
                colors: None,
            },
        );
        if step == 4 {
            delta.removed.insert(BlockKey::new(1, 0, 0));
        }
        bridge.publish("/voxblox_node/mesh", &encode_delta(&delta));
    }

    let mut map = MeshMap::new();
    while map.deltas_applied() < 5 {
        sensor.pump_events();
        for delta in sensor.poll_decoded() {
            for (key, action) in map.apply(delta) {
                println!("{:?} block {}", action, key);
            }
        }
        thread::sleep(Duration::from_millis(5));
    }

    println!(
        "Mesh has {} blocks and {} triangles",
        map.block_count(),
        map.triangle_count()
    );

    sensor.shutdown();
    Ok(())
}
