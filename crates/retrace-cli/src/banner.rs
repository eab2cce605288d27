use retrace_core::Layout;
use std::path::Path;

use crate::config::Endpoint;

pub const LOGO: &str = r#"
  ┬─┐┌─┐┌┬┐┬─┐┌─┐┌─┐┌─┐
  ├┬┘├┤  │ ├┬┘├─┤│  ├┤
  ┴└─└─┘ ┴ ┴└─┴ ┴└─┘└─┘
"#;

pub fn print_startup(mode: &str, recording_dir: &Path, layout: Layout, endpoints: &[Endpoint]) {
    eprintln!("{}", LOGO);
    eprintln!("  v{} | {} mode\n", env!("CARGO_PKG_VERSION"), mode);
    eprintln!("  recordings: {} ({} layout)", recording_dir.display(), layout);
    for endpoint in endpoints {
        eprintln!(
            "  ✓ http://{} -> {}",
            endpoint.listen_addr(),
            endpoint.target_base_url()
        );
        if let Some(health) = &endpoint.config.health {
            eprintln!("      health check: {}", health);
        }
    }
    eprintln!();
    eprintln!("  Send a Test-Name header to group requests into one recording.");
    eprintln!("  Ctrl+C to stop.\n");
}
