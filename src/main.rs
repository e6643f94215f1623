use async_trait::async_trait;
use fcgi_host::config::Config;
use fcgi_host::{ListenAddr, Listener, Responder, ResponderRequest, Server};

/// Answers every request with a plain-text dump of its parameters and input.
struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn process(&mut self, request: &mut ResponderRequest) -> i32 {
        let mut names: Vec<&String> = request.params().keys().collect();
        names.sort();

        let mut body = String::new();
        for name in names {
            body.push_str(&format!("{}={}\n", name, request.params()[name]));
        }
        body.push_str(&format!("\n{} bytes of input\n", request.input().len()));

        let response = format!(
            "Content-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        request.write_stdout(response.as_bytes()).await;
        0
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let addr = ListenAddr::parse(&cfg.listen_addr)?;

    let server = Server::new(cfg.server_settings(), |_: &ResponderRequest| {
        Box::new(EchoResponder) as Box<dyn Responder>
    })?;
    server.start(Listener::bind(&addr).await?)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.stop().await;

    Ok(())
}
