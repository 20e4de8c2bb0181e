use dynobench_core::device::list_ports;

pub fn run() -> anyhow::Result<()> {
    let ports = list_ports();
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        match port.product {
            Some(product) => println!("{}\t{}", port.name, product),
            None => println!("{}", port.name),
        }
    }
    Ok(())
}
