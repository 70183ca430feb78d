//! Cook command - build packages from a recipe

use crate::cli::args::CookArgs;
use crate::config::{self, EngineConfig, TlsConfig};
use crate::cook::{self, CookOptions};
use crate::docker::Docker;
use crate::error::{KilnError, KilnResult};
use tracing::debug;

/// Execute the cook command
pub async fn execute(args: CookArgs) -> KilnResult<()> {
    let tls = args.wants_tls().then(|| TlsConfig {
        ca_file: args.tlscacert.clone(),
        cert_file: args.tlscert.clone(),
        key_file: args.tlskey.clone(),
        verify: args.tlsverify,
    });

    let engine = EngineConfig::resolve(args.host.as_deref(), tls)?;
    debug!("engine host: {:?}", engine.host);
    let docker = Docker::new(engine)?;

    let options = CookOptions {
        image: args.image,
        recipe_path: args.recipe,
        distribution: args.distribution,
        format: args.format,
        keep: args.keep,
        overwrite: args.overwrite,
        update: args.update,
        cache_dir: config::cache_dir(args.cache_dir.as_ref()),
        out_dir: std::env::current_dir()
            .map_err(|e| KilnError::io("getting current directory", e))?,
    };

    cook::cook(&docker, &options).await
}
