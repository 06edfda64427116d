use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Duration};

use gust_client::{MqttTransport, Transport};
use gust_core::{GustError, TopicFilter};

const CONNECT: u8 = 0x10;
const PUBLISH: u8 = 0x30;
const SUBSCRIBE: u8 = 0x80;
const PINGREQ: u8 = 0xC0;
const DISCONNECT: u8 = 0xE0;

type Peers = Arc<Mutex<Vec<(Vec<TopicFilter>, mpsc::UnboundedSender<Vec<u8>>)>>>;

async fn read_packet(reader: &mut OwnedReadHalf) -> io::Result<(u8, Vec<u8>)> {
    let header = reader.read_u8().await?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await?;
        len |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "remaining length"));
        }
    }
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

fn packet(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![header];
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out.extend_from_slice(body);
    out
}

fn read_str(body: &[u8], at: usize) -> (String, usize) {
    let len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
    let s = String::from_utf8_lossy(&body[at + 2..at + 2 + len]).to_string();
    (s, at + 2 + len)
}

/// Minimal QoS 0 broker: CONNECT, SUBSCRIBE, PUBLISH fan-out, PINGREQ, DISCONNECT
async fn spawn_broker(connack_code: u8) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let peers: Peers = Arc::new(Mutex::new(Vec::new()));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(handle_peer(socket, peers.clone(), connack_code));
        }
    });
    addr
}

async fn handle_peer(socket: TcpStream, peers: Peers, connack_code: u8) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let index = {
        let mut guard = peers.lock().await;
        guard.push((Vec::new(), tx.clone()));
        guard.len() - 1
    };

    while let Ok((header, body)) = read_packet(&mut reader).await {
        match header & 0xF0 {
            CONNECT => {
                let _ = tx.send(packet(0x20, &[0x00, connack_code]));
                if connack_code != 0 {
                    break;
                }
            }
            SUBSCRIBE => {
                let mut at = 2;
                let mut codes = vec![body[0], body[1]];
                while at < body.len() {
                    let (filter, next) = read_str(&body, at);
                    at = next + 1;
                    peers.lock().await[index].0.push(TopicFilter::new(&filter).unwrap());
                    codes.push(0x00);
                }
                let _ = tx.send(packet(0x90, &codes));
            }
            PUBLISH => {
                let qos = (header >> 1) & 0x03;
                let (topic, mut at) = read_str(&body, 0);
                if qos > 0 {
                    at += 2;
                }
                let payload = &body[at..];
                let mut out = Vec::with_capacity(2 + topic.len() + payload.len());
                out.extend_from_slice(&(topic.len() as u16).to_be_bytes());
                out.extend_from_slice(topic.as_bytes());
                out.extend_from_slice(payload);
                let frame = packet(PUBLISH, &out);
                for (filters, peer) in peers.lock().await.iter() {
                    if filters.iter().any(|f| f.matches(&topic)) {
                        let _ = peer.send(frame.clone());
                    }
                }
            }
            PINGREQ => {
                let _ = tx.send(vec![0xD0, 0x00]);
            }
            DISCONNECT => break,
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_connect_speaks_mqtt_on_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let connecting = tokio::spawn(async move { MqttTransport::new(addr).connect("camera_x").await });

    let (socket, _) = listener.accept().await.unwrap();
    let (mut reader, mut writer) = socket.into_split();
    let (header, body) = read_packet(&mut reader).await.unwrap();
    assert_eq!(header & 0xF0, CONNECT);
    assert_eq!(&body[..7], &[0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04]);
    let (client_id, _) = read_str(&body, 10);
    assert_eq!(client_id, "camera_x");

    writer.write_all(&packet(0x20, &[0x00, 0x00])).await.unwrap();
    let conn = timeout(Duration::from_secs(5), connecting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(conn.id(), "camera_x");

    conn.disconnect().await.unwrap();
    let (header, _) = timeout(Duration::from_secs(5), read_packet(&mut reader))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header, DISCONNECT);
}

#[tokio::test]
async fn test_publish_echoes_back_to_subscriber() {
    let _ = tracing_subscriber::fmt().try_init();
    let addr = spawn_broker(0).await;
    let transport = MqttTransport::new(addr);

    let mut conn = transport.connect("camera_a").await.unwrap();
    conn.subscribe("realm/s/scene/#").await.unwrap();
    conn.publish("realm/s/scene/camera_a", b"hello".to_vec())
        .await
        .unwrap();

    let got = timeout(Duration::from_secs(5), conn.recv())
        .await
        .expect("echo should arrive")
        .expect("inbox open");
    assert_eq!(got.topic, "realm/s/scene/camera_a");
    assert_eq!(&got.payload[..], b"hello");
    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publishes_reach_other_sessions_by_filter() {
    let addr = spawn_broker(0).await;
    let transport = MqttTransport::new(addr);

    let mut watcher = transport.connect("watcher").await.unwrap();
    let mut bystander = transport.connect("bystander").await.unwrap();
    let mut camera = transport.connect("camera").await.unwrap();
    watcher.subscribe("realm/s/+/camera").await.unwrap();
    bystander.subscribe("cpu_mem").await.unwrap();
    sleep(Duration::from_millis(100)).await;

    camera.publish("realm/s/scene/camera", b"pose".to_vec()).await.unwrap();

    let got = timeout(Duration::from_secs(5), watcher.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&got.payload[..], b"pose");
    sleep(Duration::from_millis(50)).await;
    assert!(bystander.try_recv().is_none());
}

#[tokio::test]
async fn test_refused_connack_is_a_connection_error() {
    // 0x05: not authorized
    let addr = spawn_broker(0x05).await;
    let result = MqttTransport::new(addr).connect("camera").await;
    assert!(matches!(result, Err(GustError::Connection(_))));
}

#[tokio::test]
async fn test_unreachable_endpoint_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let result = MqttTransport::new(addr).connect("camera").await;
    assert!(matches!(result, Err(GustError::Connection(_))));
}

#[tokio::test]
async fn test_bad_filter_rejected_before_sending() {
    let addr = spawn_broker(0).await;
    let mut conn = MqttTransport::new(addr).connect("camera").await.unwrap();
    assert!(conn.subscribe("a/#/b").await.is_err());
    assert!(conn.is_open());
}
