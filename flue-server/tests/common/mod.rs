//! Common test utilities: a scripted model and a server on an ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flue_core::{GenerationMode, Invocation, ModelLike, PipelineError, SharedModel};
use flue_server::{app, auth::Credentials, AppState};
use futures::{SinkExt, StreamExt};
use image::DynamicImage;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

pub const USERNAME: &str = "ada";
pub const PASSWORD: &str = "secret";

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the fake model saw for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub num_images: usize,
    pub seed: Option<u64>,
    pub masked: bool,
}

/// Produces blank images, but runs out of memory above `capacity` images.
pub struct FakeModel {
    pub capacity: usize,
    pub step_delay: Duration,
    pub calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeModel {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            step_delay: Duration::from_millis(1),
            calls: Arc::default(),
        }
    }

    pub fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }
}

impl ModelLike for FakeModel {
    fn run(
        &mut self,
        invocation: &Invocation,
        on_step: &mut dyn FnMut(usize),
    ) -> Result<Vec<DynamicImage>, PipelineError> {
        let masked = matches!(
            invocation.mode.as_ref(),
            GenerationMode::ImageToImage { mask: Some(_), .. }
                | GenerationMode::Inpainting { mask: Some(_), .. }
        );
        self.calls.lock().unwrap().push(Call {
            num_images: invocation.num_images,
            seed: invocation.seed,
            masked,
        });

        for step in 0..invocation.num_inference_steps {
            if invocation.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            on_step(step);
            std::thread::sleep(self.step_delay);
            if invocation.num_images > self.capacity {
                return Err(PipelineError::ResourceExhausted);
            }
        }

        let (width, height) = invocation.mode.dimensions();
        Ok((0..invocation.num_images)
            .map(|_| DynamicImage::new_rgb8(width as u32, height as u32))
            .collect())
    }
}

/// Starts the app on an ephemeral port and returns its address.
pub async fn spawn_server(model: FakeModel) -> SocketAddr {
    let state = AppState::new(Credentials::new(USERNAME, PASSWORD), SharedModel::new(model));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    addr
}

pub async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    client
}

pub async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Connects and completes the credential handshake.
pub async fn authorized(addr: SocketAddr, path: &str) -> Client {
    let mut client = connect(addr, path).await;
    send_json(
        &mut client,
        json!({"username": USERNAME, "password": PASSWORD}),
    )
    .await;
    client
}

/// How a streaming session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Finished(Value),
    Closed { code: u16, reason: String },
    Dropped,
}

/// Collects progress events until the session finishes or closes.
pub async fn run_to_end(client: &mut Client) -> (Vec<f64>, Outcome) {
    let mut progress = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .expect("session stalled");
        match message {
            Some(Ok(Message::Text(text))) => {
                let event: Value = serde_json::from_str(&text).unwrap();
                match event["status"].as_str() {
                    Some("progress") => progress.push(event["progress"].as_f64().unwrap()),
                    Some("finished") => return (progress, Outcome::Finished(event["result"].clone())),
                    other => panic!("unexpected status {other:?}"),
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let outcome = match frame {
                    Some(frame) => Outcome::Closed {
                        code: u16::from(frame.code),
                        reason: frame.reason.to_string(),
                    },
                    None => Outcome::Dropped,
                };
                return (progress, outcome);
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return (progress, Outcome::Dropped),
        }
    }
}

pub fn png_data_url(image: &DynamicImage) -> String {
    flue_server::transport::encode_image(image).unwrap()
}
