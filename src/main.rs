use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byte_unit::Byte;
use log::{error, info};
use rand::prelude::*;
use simplelog::*;
use time::macros::format_description;

use rrpc_ftl::config::Lpa;
use rrpc_ftl::{Ftl, FtlConfig, Geometry, MemMedia, Submit};

fn write_retry(ftl: &Ftl, lpa: Lpa, data: &[u8]) -> rrpc_ftl::Result<()> {
    loop {
        match ftl.write(lpa, data)? {
            Submit::Done(()) => return Ok(()),
            Submit::Requeue => thread::sleep(Duration::from_micros(50)),
        }
    }
}

fn run(ftl: &Ftl) -> rrpc_ftl::Result<()> {
    let page_size = ftl.config().geometry.page_size;
    let max_lpa = ftl.nr_lpas();

    for lpa in 0..max_lpa {
        write_retry(ftl, lpa, &vec![lpa as u8; page_size])?;
    }
    info!("Drive preconditioned");

    let mut rng: SmallRng = SmallRng::seed_from_u64(7);
    for c in 0..4 {
        for _ in 0..max_lpa {
            let lpa = rng.gen_range(0..max_lpa);
            write_retry(ftl, lpa, &vec![rng.gen::<u8>(); page_size])?;
        }
        info!("Capacity {} randomly written", c);
    }

    ftl.verify()?;
    let stats = ftl.stats();
    info!(
        "{} blocks reclaimed, {} pages moved, {} requeues",
        stats.gc_blocks_reclaimed, stats.gc_pages_moved, stats.requeues
    );
    Ok(())
}

fn main() {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();

    if let Err(err) = SimpleLogger::init(LevelFilter::Info, log_cfg) {
        eprintln!("failed to set up logging: {}", err);
    }

    let geometry = Geometry {
        luns: 2,
        blocks_per_lun: 64,
        pages_per_block: 128,
        ..Geometry::default()
    };
    let config = FtlConfig {
        over_provisioning: 20.0,
        ..FtlConfig::with_geometry(geometry)
    };
    info!(
        "media of {} across {} luns",
        Byte::from_bytes(geometry.capacity() as u128).get_appropriate_unit(true),
        geometry.luns
    );

    let media = Arc::new(MemMedia::new(geometry));
    let ftl = match Ftl::new(media, config) {
        Ok(ftl) => ftl,
        Err(err) => {
            error!("mount failed: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(&ftl) {
        error!("workload failed: {}", err);
        std::process::exit(1);
    }
}
