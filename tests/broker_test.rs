use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use staffa::broker::Broker;
use staffa::config::BrokerConfig;
use staffa::wallet::{Currency, Wallet};

struct Client {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(port: u16, client_id: &str, token: &str) -> Result<(Client, String)> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let (read, writer) = stream.into_split();
        let mut client = Client {
            reader: BufReader::new(read).lines(),
            writer,
        };
        client.send(&format!("ID:{client_id},TOKEN:{token}")).await?;
        let greeting = client.recv().await?;
        Ok((client, greeting))
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.reader.next_line())
            .await??
            .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
        Ok(line)
    }
}

/// Broker over a real socket with a pinned price and no background refresher,
/// so every scenario sees the same market.
async fn start_broker(dir: &tempfile::TempDir, price: f64) -> Result<(Arc<Broker>, u16)> {
    let config = BrokerConfig {
        data_dir: dir.path().to_path_buf(),
        ..BrokerConfig::default()
    };
    let broker = Broker::new(config)?;
    broker.feed().publish(price);
    broker.queue().start();

    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(Arc::clone(&broker).serve(listener));
    Ok((broker, port))
}

#[tokio::test]
async fn test_that_half_balance_buy_completes_at_the_quoted_price() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (broker, port) = start_broker(&dir, 100.0).await?;

    let (mut client, greeting) = Client::connect(port, "ada", "pw").await?;
    assert_eq!(greeting, "AUTH NEW");

    client.send("BUY SRD-BTC 50").await?;
    assert_eq!(
        client.recv().await?,
        "OK: Your BUY request has been submitted for processing."
    );
    let result = client.recv().await?;
    assert!(result.starts_with("TRANSACTION_RESULT ID=TX1 STATUS=COMPLETED TYPE=BUY"));
    assert!(result.contains("TOTAL=5000.00"));
    assert!(result.contains("PRICE=100.00000000"));

    client.send("SHOW WALLET").await?;
    let balance = client.recv().await?;
    assert!(balance.starts_with("BALANCE USD: 5000.00, SRD-BTC: 49.99"));

    client.send("QUIT").await?;
    assert_eq!(client.recv().await?, "OK: Disconnecting.");
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_that_a_full_round_trip_ends_two_fees_short_of_flat() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (broker, port) = start_broker(&dir, 100.0).await?;

    let (mut client, _) = Client::connect(port, "ada", "pw").await?;
    client.send("BUY SRD-BTC 50").await?;
    client.recv().await?;
    client.recv().await?;

    client.send("SELL SRD-BTC 100").await?;
    assert_eq!(
        client.recv().await?,
        "OK: Your SELL request has been submitted for processing."
    );
    let result = client.recv().await?;
    assert!(result.starts_with("TRANSACTION_RESULT ID=TX2 STATUS=COMPLETED TYPE=SELL"));

    client.send("SHOW WALLET").await?;
    let balance = client.recv().await?;
    // Strictly below the initial 10000 by the two fees, and the position is flat.
    assert!(balance.starts_with("BALANCE USD: 9999."));
    assert!(balance.ends_with("SRD-BTC: 0.0000000000"));

    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_that_a_buy_outrun_by_the_price_fails_on_funds() -> Result<()> {
    let dir = tempfile::tempdir()?;

    // Seed a poor wallet before the client ever connects.
    {
        let wallet = Wallet::open("bob", &dir.path().join("wallets"))?;
        wallet.with_state(|state| {
            let usd = state.balance(Currency::Usd);
            state.debit(Currency::Usd, usd - 100.0);
        });
        wallet.save()?;
    }

    // The execution worker stays parked so the market can move between the
    // order being sized and the order being validated.
    let config = BrokerConfig {
        data_dir: dir.path().to_path_buf(),
        ..BrokerConfig::default()
    };
    let broker = Broker::new(config)?;
    broker.feed().publish(1000.0);
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(Arc::clone(&broker).serve(listener));

    let (mut client, greeting) = Client::connect(port, "bob", "pw").await?;
    assert_eq!(greeting, "AUTH NEW");

    client.send("SHOW WALLET").await?;
    assert!(client.recv().await?.starts_with("BALANCE USD: 100.00"));

    client.send("BUY SRD-BTC 100").await?;
    assert!(client.recv().await?.starts_with("OK:"));

    broker.feed().publish(4000.0);
    broker.queue().start();

    let result = client.recv().await?;
    assert!(result.contains("STATUS=FAILED"));
    assert!(result.contains("REASON=insufficient USD funds"));

    client.send("SHOW WALLET").await?;
    assert!(client.recv().await?.starts_with("BALANCE USD: 100.00"));

    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_that_results_come_back_in_submission_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (broker, port) = start_broker(&dir, 100.0).await?;

    let (mut client, _) = Client::connect(port, "ada", "pw").await?;
    for _ in 0..3 {
        client.send("BUY SRD-BTC 10").await?;
        assert!(client.recv().await?.starts_with("OK:"));
    }

    let mut previous = 0u64;
    for _ in 0..3 {
        let result = client.recv().await?;
        assert!(result.contains("STATUS=COMPLETED"));
        let id: u64 = result
            .split_whitespace()
            .find_map(|field| field.strip_prefix("ID=TX"))
            .unwrap()
            .parse()?;
        assert!(id > previous);
        previous = id;
    }

    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_that_duplicate_connections_are_turned_away() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (broker, port) = start_broker(&dir, 100.0).await?;

    let (mut first, greeting) = Client::connect(port, "ada", "pw").await?;
    assert_eq!(greeting, "AUTH NEW");

    let (_second, refused) = Client::connect(port, "ada", "pw").await?;
    assert_eq!(refused, "AUTH FAIL: Already connected with this ID.");

    first.send("GET_PRICE SRD-BTC").await?;
    assert_eq!(first.recv().await?, "PRICE SRD-BTC 100.00000000");

    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_that_balances_survive_reconnection() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (broker, port) = start_broker(&dir, 100.0).await?;

    let (mut client, _) = Client::connect(port, "ada", "pw").await?;
    client.send("BUY SRD-BTC 50").await?;
    client.recv().await?;
    client.recv().await?;
    client.send("QUIT").await?;
    client.recv().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut back, greeting) = Client::connect(port, "ada", "pw").await?;
    assert_eq!(greeting, "AUTH SUCCESS");
    back.send("SHOW WALLET").await?;
    assert!(back.recv().await?.starts_with("BALANCE USD: 5000.00"));
    back.send("SHOW TRANSACTIONS").await?;
    assert_eq!(back.recv().await?, "TRANSACTION_HISTORY (Total: 1, Showing last 1):");
    assert!(back.recv().await?.starts_with("- TX1 BUY SRD-BTC"));

    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_that_the_bot_trades_through_the_queue() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = BrokerConfig {
        data_dir: dir.path().to_path_buf(),
        bot_interval: Duration::from_millis(20),
        ..BrokerConfig::default()
    };
    let broker = Broker::new(config)?;
    broker.feed().publish(100.0);
    broker.queue().start();
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(Arc::clone(&broker).serve(listener));

    let (mut client, _) = Client::connect(port, "ada", "pw").await?;
    client.send("START BOT 5 1.0").await?;
    assert_eq!(client.recv().await?, "BOT STARTED.");

    // On a flat market the bands collapse onto the price, so the first full
    // window already reads as an entry signal: the bot must submit a BUY and
    // get a completion back through the queue.
    let result = client.recv().await?;
    assert!(result.starts_with("TRANSACTION_RESULT"));
    assert!(result.contains("STATUS=COMPLETED"));
    assert!(result.contains("TYPE=BUY"));

    client.send("STOP BOT").await?;
    loop {
        let line = client.recv().await?;
        if line == "BOT STOPPED." {
            break;
        }
        // The collapsed bands can keep the bot oscillating until the stop
        // lands; anything else in between must be a transaction result.
        assert!(line.starts_with("TRANSACTION_RESULT"));
    }

    broker.shutdown().await;
    Ok(())
}
