//! An example that lists all installed kernel specs.

use burlap::kernelspec::KernelSpecResolver;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let resolver = KernelSpecResolver::from_env();
    let specs = resolver.find_kernel_specs().await;
    if specs.is_empty() {
        println!("No kernels installed.");
        return;
    }

    println!("Available kernels:");
    for (name, path) in &specs {
        match resolver.get_kernel_spec(name).await {
            Ok((_, spec)) => {
                println!("  {:16} {:24} {}", name, spec.display_name, path.display())
            }
            Err(err) => println!("  {:16} (unreadable: {err})", name),
        }
    }
}
