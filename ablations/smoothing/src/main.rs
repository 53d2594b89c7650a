//! 空间正则化消融实验: 非空间 EM 基线与不同 β, 不同团势, 以及偏置场校正
//! 在合成体模上的误分类率对比.

mod profile;
mod result;
mod runner;

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();
    runner::run().analyze();
}
