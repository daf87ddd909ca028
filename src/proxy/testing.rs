//! Loopback upstreams used by the proxy tests.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

use crate::config;

use super::cluster::ClusterRegistry;

/// Answers every request on every connection with `status` and `body`.
pub async fn serve_json(status: u16, body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf[read..]).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => read += n,
                        }
                        if read == buf.len() {
                            return;
                        }
                    }
                    read = 0;

                    let response = format!(
                        "HTTP/1.1 {status} Test\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
                        body.len()
                    );
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    addr
}

/// Accepts connections and never answers.
pub async fn serve_silence() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    addr
}

pub fn registry(clusters: &[(&str, SocketAddr)]) -> Arc<ClusterRegistry> {
    let clusters: Vec<config::Cluster> = clusters
        .iter()
        .map(|(id, addr)| config::Cluster {
            id: id.to_string(),
            nodes: [(addr.to_string(), 1)].into_iter().collect(),
            r#type: config::SelectionType::RoundRobin,
            scheme: config::ClusterScheme::HTTP,
            host: None,
            timeout: None,
        })
        .collect();
    Arc::new(ClusterRegistry::from_config(&clusters).unwrap())
}
