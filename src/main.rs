use bytes::Bytes;
use clap::Parser;
use h2mux::codec::loopback;
use h2mux::{
    drive, load_config, BodyPipe, ChannelConsumer, ConnectionEvent, ErrorCode, ExchangeEvent,
    ExchangeHandle, Headers, MuxBuilder, MuxConfig, MuxError, MuxHandle, Role, Settings, StreamId,
};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "h2mux-loopback")]
#[command(about = "Run a client and a server multiplexer against each other in memory", long_about = None)]
struct Args {
    /// TOML configuration shared by both sides (the role is set per side).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Concurrent echo requests to send.
    #[arg(short, long, default_value_t = 4)]
    requests: usize,

    /// Body chunks per request.
    #[arg(long, default_value_t = 8)]
    chunks: usize,

    #[arg(long, default_value_t = 1024)]
    chunk_size: usize,

    /// Let the server push one extra response per request.
    #[arg(long)]
    push: bool,

    #[arg(long)]
    debug_streams: bool,
}

struct Response {
    stream_id: Option<StreamId>,
    status: Option<u16>,
    body: Bytes,
    pushed: Vec<ExchangeHandle>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();
    let base = match args.config.as_deref() {
        Some(path) => load_config(path)?,
        None => MuxConfig::default(),
    };
    let pipe_capacity = base.body_pipe_capacity;
    let client_config = MuxConfig {
        role: Role::Client,
        debug_streams: base.debug_streams || args.debug_streams,
        ..base.clone()
    };
    let server_config = MuxConfig {
        role: Role::Server,
        ..client_config.clone()
    };

    let client_settings = Settings {
        enable_push: args.push,
        ..Settings::default()
    };
    let (client_end, server_end) = loopback(client_settings, Settings::default());

    let (server_consumer, mut server_events) = ChannelConsumer::new(false);
    let (server_mux, server_dispatcher) = MuxBuilder::new(server_config)
        .consumer(server_consumer)
        .bind(server_end.encoder)?;
    let server_driver = tokio::spawn(drive(server_dispatcher, server_end.frames));

    let (client_consumer, _client_events) = ChannelConsumer::new(args.push);
    let (client_mux, client_dispatcher) = MuxBuilder::new(client_config)
        .consumer(client_consumer)
        .bind(client_end.encoder)?;
    let client_driver = tokio::spawn(drive(client_dispatcher, client_end.frames));

    let server = {
        let server_mux = server_mux.clone();
        let push = args.push;
        tokio::spawn(async move {
            while let Some(event) = server_events.recv().await {
                match event {
                    ConnectionEvent::IncomingStream {
                        stream_id,
                        exchange,
                    } => {
                        let server_mux = server_mux.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_echo(&server_mux, stream_id, exchange, push).await {
                                warn!("stream {}: echo failed: {}", stream_id, err);
                            }
                        });
                    }
                    ConnectionEvent::Closed { error } => {
                        info!("server connection closed (error={:?})", error);
                        break;
                    }
                    other => info!("server event: {:?}", other),
                }
            }
        })
    };

    let mut requests = Vec::with_capacity(args.requests);
    for index in 0..args.requests {
        let pipe = BodyPipe::new(pipe_capacity);
        let exchange = client_mux.request(
            Headers::request("POST", &format!("/echo/{}", index)),
            Some(pipe.clone()),
        )?;
        let chunks = args.chunks;
        let chunk = Bytes::from(vec![b'a' + (index % 26) as u8; args.chunk_size]);
        tokio::spawn(async move {
            for _ in 0..chunks {
                if let Err(err) = pipe.produce(chunk.clone()).await {
                    warn!("request {}: body producer stopped: {}", index, err);
                    return;
                }
            }
            pipe.complete();
        });
        requests.push(exchange);
    }

    for exchange in requests {
        let response = collect_response(exchange).await?;
        info!(
            "stream {:?}: status={:?} echoed {} bytes",
            response.stream_id,
            response.status,
            response.body.len()
        );
        for pushed in response.pushed {
            let pushed = collect_response(pushed).await?;
            info!(
                "stream {:?}: pushed status={:?} {} bytes",
                pushed.stream_id,
                pushed.status,
                pushed.body.len()
            );
        }
    }

    let metrics = client_mux.metrics();
    info!(
        "client done; streams={} open={} queued={} last stream={}",
        metrics.streams_total,
        client_mux.open_streams(),
        client_mux.queued_requests(),
        client_mux.last_local_stream_id()
    );
    client_mux.shutdown(ErrorCode::NoError)?;

    client_driver.await??;
    server_driver.await??;
    server.await?;
    Ok(())
}

async fn collect_response(mut exchange: ExchangeHandle) -> Result<Response, MuxError> {
    let mut response = Response {
        stream_id: exchange.stream_id(),
        status: None,
        body: Bytes::new(),
        pushed: Vec::new(),
    };
    while let Some(event) = exchange.next_event().await {
        match event {
            ExchangeEvent::Headers { headers, .. } => {
                if response.status.is_none() {
                    response.status = headers.status();
                }
            }
            ExchangeEvent::Data { body: mut consumer } => {
                response.body = consumer.read_to_end().await.map_err(|source| MuxError::Body {
                    stream_id: exchange.stream_id().unwrap_or_default(),
                    source,
                })?;
            }
            ExchangeEvent::PushOffered { exchange, .. } => response.pushed.push(exchange),
            ExchangeEvent::StreamEnded => break,
            ExchangeEvent::ConnectionClosing { .. } => {}
            ExchangeEvent::StreamReset { code } => {
                return Err(MuxError::StreamReset {
                    stream_id: response.stream_id.unwrap_or_default(),
                    code,
                })
            }
            ExchangeEvent::Failed(err) => return Err(err),
        }
    }
    response.stream_id = exchange.stream_id();
    Ok(response)
}

async fn serve_echo(
    mux: &MuxHandle,
    stream_id: StreamId,
    exchange: ExchangeHandle,
    push: bool,
) -> Result<(), MuxError> {
    let request = collect_response(exchange).await?;
    if push {
        let pushed = mux.push(stream_id, Headers::request("GET", "/pushed"))?;
        if let Some(promised_id) = pushed.stream_id() {
            let body = Bytes::from(format!("pushed alongside stream {}", stream_id));
            let pipe = BodyPipe::new(body.len().max(1));
            mux.respond(promised_id, Headers::response(200), Some(pipe.clone()))?;
            pipe.produce(body).await.map_err(|source| MuxError::Body {
                stream_id: promised_id,
                source,
            })?;
            pipe.complete();
        }
    }

    let pipe = BodyPipe::new(request.body.len().max(1));
    let headers = Headers::response(200).with("content-length", request.body.len().to_string());
    mux.respond(stream_id, headers, Some(pipe.clone()))?;
    pipe.produce(request.body)
        .await
        .map_err(|source| MuxError::Body { stream_id, source })?;
    pipe.complete();
    Ok(())
}
