use anyhow::Result;

use lealt::config::Config;
use lealt::tuning::{self, Field, DOMAIN_FIELDS, EMS_TABLE_KEY, GOVERNOR_FIELDS, NODE_FIELDS};

fn print_fields<T>(prefix: &str, fields: &[Field<T>], target: &T) {
    for f in fields {
        let name = format!("{}{}", prefix, f.name);
        println!("  {:<32} {:>10}   [{}, {}]", name, f.read(target), f.min, f.max);
    }
}

pub fn run_tunables(cfg: &Config) -> Result<()> {
    let gov = cfg.governor_tunables()?;
    println!("LEALT TUNABLES");
    println!();
    println!("  {:<32} {:>10}   RANGE", "PATH", "VALUE");
    println!("  {}", "-".repeat(60));
    print_fields("", GOVERNOR_FIELDS, &gov);
    println!("  {:<32} {:>10}", EMS_TABLE_KEY, format!("\"{}\"", tuning::format_ems_table(&gov.ems_table)));

    for (i, n) in cfg.nodes.iter().enumerate() {
        print_fields(&format!("node{}/", i), NODE_FIELDS, &n.tunables());
    }
    for d in &cfg.domains {
        print_fields(&format!("domain{}/", d.id), DOMAIN_FIELDS, &d.tunables());
    }
    Ok(())
}
