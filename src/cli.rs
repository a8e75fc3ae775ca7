//! Interface de linha de comando do framewright baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, profiles, backoff)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use framewright::config::DEFAULT_CONFIG_PATH;

/// framewright: chamadas resilientes a dependências e fluxo de status de pedidos.
#[derive(Debug, Parser)]
#[command(name = "framewright", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Leva pedidos pelo pipeline completo contra um banco em memória instável.
    Demo {
        /// Quantidade de pedidos a processar.
        #[arg(long, default_value_t = 12)]
        orders: usize,

        /// Probabilidade (0.0 a 1.0) de cada chamada ao banco falhar.
        #[arg(long, default_value_t = 0.2, value_parser = parse_rate)]
        failure_rate: f64,
    },

    /// Mostra os perfis efetivos das dependências em JSON.
    Profiles,

    /// Mostra a sequência de atrasos de retentativa de uma dependência.
    Backoff {
        /// Nome da dependência registrada.
        dependency: String,
    },
}

// Aceita apenas probabilidades no intervalo [0, 1].
fn parse_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("failure rate must be between 0 and 1, got {rate}"))
    }
}
