#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use rkv_common::messages::{encode_message, RpbErrorResp};
use rkv_common::{Frame, Framer, MessageCode};

/// What the fake server does with one request.
pub enum Respond {
    /// Write these frames back in a single write.
    Frames(Vec<Frame>),
    /// Wait, then write.
    Delayed(Duration, Vec<Frame>),
    /// Drop the connection.
    Close,
    /// Never answer.
    Silent,
}

impl Respond {
    pub fn one(frame: Frame) -> Self {
        Respond::Frames(vec![frame])
    }

    pub fn empty(code: MessageCode) -> Self {
        Respond::one(Frame::empty(code))
    }

    pub fn error(message: &str) -> Self {
        let resp = RpbErrorResp {
            errmsg: message.as_bytes().to_vec(),
            errcode: 0,
        };
        Respond::one(Frame::new(MessageCode::ErrorResp, encode_message(&resp)))
    }
}

type Handler = Arc<dyn Fn(&Frame) -> Respond + Send + Sync>;

/// In-process server speaking the framed protocol.
pub struct FakeServer {
    pub addr: String,
    requests: Arc<Mutex<Vec<Frame>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Frame) -> Respond + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let handler: Handler = Arc::new(handler);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        {
            let requests = requests.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, handler.clone(), requests.clone()));
                }
            });
        }

        FakeServer {
            addr,
            requests,
            connections,
        }
    }

    /// Answers every ping, nothing else.
    pub async fn pinger() -> Self {
        Self::start(|_| Respond::empty(MessageCode::PingResp)).await
    }

    pub fn requests(&self) -> Vec<Frame> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(mut socket: TcpStream, handler: Handler, requests: Arc<Mutex<Vec<Frame>>>) {
    let mut framer = Framer::new();
    loop {
        match socket.read_buf(framer.buffer_mut()).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let frames = match framer.drain() {
            Ok(frames) => frames,
            Err(_) => return,
        };
        for frame in frames {
            requests.lock().unwrap().push(frame.clone());
            let (delay, replies) = match handler(&frame) {
                Respond::Frames(replies) => (None, replies),
                Respond::Delayed(delay, replies) => (Some(delay), replies),
                Respond::Close => return,
                Respond::Silent => continue,
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut out = BytesMut::new();
            for reply in &replies {
                reply.encode_to(&mut out).unwrap();
            }
            if socket.write_all(&out).await.is_err() {
                return;
            }
        }
    }
}

/// Address of a port nothing listens on.
pub async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);
    addr
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `check` until it holds or the timeout expires.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
