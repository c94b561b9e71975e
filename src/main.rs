use sluice::{
    broker::Broker,
    error::Error,
    tokens::{token_pipeline, Network, TokenSource},
    Application,
};

async fn setup(broker: Broker) -> Result<Application, Error> {
    let networks = vec![
        Network::new("ethereum", 1),
        Network::new("optimism", 10),
        Network::new("polygon", 137),
        Network::new("base", 8453),
        Network::new("arbitrum", 42161),
    ];

    let sources = vec![
        TokenSource::new("CoingeckoProcessor", ["1-USDC", "1-WETH", "137-POL"]),
        TokenSource::new("TokenListProcessor:1INCH", ["1-1INCH", "10-OP"]),
        TokenSource::new("TokenListProcessor:AAVE", ["1-AAVE", "137-AAVE"]),
        TokenSource::new("TokenListProcessor:MYCRYPTO", ["1-MKR"]),
        TokenSource::new("TokenListProcessor:SUPERCHAIN", ["10-USDC", "8453-USDC"]),
    ];

    token_pipeline()
        .broker(broker)
        .networks(networks)
        .sources(sources)
        .assemble()
        .await
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    sluice::run().setup(setup).start().await
}
