use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use tracing_subscriber::EnvFilter;
use webauthn_verify::{
    testing::{test_config, SyntheticAuthenticator},
    CredentialStore, MemoryStore, RelyingParty,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let rp = RelyingParty::new(test_config(), MemoryStore::new());
    let authenticator = SyntheticAuthenticator::fido_u2f();

    // Registration
    let options = rp.begin_registration("demo-account").await?;
    let challenge = URL_SAFE_NO_PAD.decode(&options.challenge)?;
    let response = authenticator.registration_response(rp.config(), &challenge);
    let result = rp.finish_registration("demo-account", &response).await?;
    println!("registration: {}", serde_json::to_string_pretty(&result)?);

    let Some(credential) = result.credential else {
        println!("Registration failed: {:?}", result.failure_reason);
        return Ok(());
    };
    rp.store().save_credential(credential).await?;

    // Authentication
    let options = rp.begin_authentication("demo-account").await?;
    let challenge = URL_SAFE_NO_PAD.decode(&options.challenge)?;
    let response = authenticator.authentication_response(rp.config(), &challenge, 1);
    match rp.finish_authentication(&response).await? {
        result if result.verified => println!("Verification successful!"),
        result => println!("Verification failed: {:?}", result.failure_reason),
    }

    println!("store: {:?}", rp.store().stats());
    Ok(())
}
