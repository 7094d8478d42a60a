use std::path::Path;

use anyhow::Result;

use lealt::config::Config;
use lealt::governor::Governor;
use lealt::sim::SimWorld;

pub fn run_check(cfg: &Config, path: Option<&Path>) -> Result<()> {
    println!("LEALT CONFIGURATION CHECK");
    match path {
        Some(p) => println!("  SOURCE:               {}", p.display()),
        None => println!("  SOURCE:               BUILT-IN REFERENCE BOARD"),
    }
    println!();

    // LOADING ALREADY VALIDATED; WHAT IS LEFT IS THE SUMMARY
    println!("OPERATING POINTS ({}):", cfg.opp_table.len());
    for chunk in cfg.opp_table.chunks(6) {
        let row: Vec<String> = chunk.iter().map(|f| format!("{:>8}", f)).collect();
        println!("  {}", row.join(" "));
    }
    println!();

    println!("NODES:");
    for (i, n) in cfg.nodes.iter().enumerate() {
        let t = n.tunables();
        println!(
            "  node{} {:<10} cores={:<2} caps={:?} ratio_ceil={} lock=[{}%,{}%] llc_on_th={} map_rows={}",
            i, n.name, n.cores.len(), n.capabilities()?, t.ratio_ceil,
            t.minlock_ratio, t.maxlock_ratio, t.llc_on_th, n.freq_map.len(),
        );
        if n.freq_map.is_empty() {
            println!("         WARNING: NO FREQ MAP -- NODE NEVER CONSTRAINS TARGET LOAD");
        }
    }
    println!();

    println!("DOMAINS:");
    if cfg.domains.is_empty() {
        println!("  NONE -- STABILITY TRACKING AND PREPARE-HOLD DISABLED");
    }
    for d in &cfg.domains {
        let t = d.tunables();
        println!(
            "  domain{:<3} node={:<10} prepare={}@{} stability_th={}%",
            d.id, d.node.as_deref().unwrap_or("-"), t.prepare_freq, t.prepare_cond, t.stability_th,
        );
    }
    println!();

    let tun = cfg.governor_tunables()?;
    println!("EMS TABLE:            {} rows", tun.ems_table.len());
    println!("LLC REGION:           {} ({} ways)", cfg.llc.region, cfg.llc.ways);
    println!();

    // FULL START/STOP AGAINST THE SIMULATED BOARD
    let world = SimWorld::new(cfg, 0);
    let mut gov = Governor::new(crate::build_context(cfg, &world)?);
    gov.start()?;
    gov.stop();
    println!("  START/STOP            OK");
    println!();
    println!("ALL CHECKS PASSED");
    Ok(())
}
