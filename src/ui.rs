//! Interface de terminal do framewright: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso da demonstração e
//! `console` para estilização com cores. O [`DemoProgress`] acompanha
//! visualmente os pedidos avançando pelo pipeline.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::resilience::{BreakerMetrics, BreakerState};
use crate::workflow::{OrderStatus, StatusTransition, TransitionKind, WorkItem};

/// Indicador visual de progresso para a demonstração no terminal.
///
/// Cada transição gravada avança a barra; falhas e retentativas aparecem
/// acima dela em amarelo ou vermelho.
pub struct DemoProgress {
    // Barra de progresso do indicatif.
    pb: ProgressBar,
    // Estilo amarelo para avisos.
    yellow: Style,
    // Estilo vermelho para falhas.
    red: Style,
}

impl DemoProgress {
    /// Inicia a barra com o total de transições esperadas.
    pub fn start(total: u64) -> Self {
        let pb = ProgressBar::new(total);
        if let Ok(style) =
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.enable_steady_tick(Duration::from_millis(100));
        Self::with_bar(pb)
    }

    /// Barra invisível, para testes e saída redirecionada.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(pb: ProgressBar) -> Self {
        Self {
            pb,
            yellow: Style::new().yellow(),
            red: Style::new().red().bold(),
        }
    }

    /// Atualiza a mensagem com a etapa em andamento.
    pub fn stage(&self, label: &str) {
        self.pb.set_message(label.to_string());
    }

    /// Conta transições gravadas com sucesso.
    pub fn recorded(&self, count: usize) {
        self.pb.inc(count as u64);
    }

    /// Exibe uma falha acima da barra.
    pub fn failure(&self, order_id: &str, error: &dyn std::fmt::Display) {
        self.pb.println(format!(
            "  {} {}: {error}",
            self.red.apply_to("✗"),
            short_id(order_id)
        ));
    }

    /// Exibe um aviso acima da barra.
    pub fn notice(&self, message: &str) {
        self.pb.println(format!("  {} {message}", self.yellow.apply_to("↻")));
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

// Os oito primeiros caracteres do UUID bastam para leitura no terminal.
fn short_id(order_id: &str) -> &str {
    order_id.get(..8).unwrap_or(order_id)
}

/// Estilo de cor associado a cada status.
fn status_style(status: OrderStatus) -> Style {
    match status {
        OrderStatus::PickedUp | OrderStatus::Completed => Style::new().green().bold(),
        OrderStatus::Delayed | OrderStatus::MysteryUnclaimed => Style::new().red(),
        _ => Style::new().cyan(),
    }
}

/// Imprime o histórico de um pedido, uma linha por transição.
pub fn print_history(item: &WorkItem, history: &[StatusTransition]) {
    let dim = Style::new().dim();
    let due = item
        .due_date
        .map_or_else(|| "no due date".to_string(), |d| format!("due {d}"));
    println!(
        "{} {} ({:?}, {})",
        Style::new().bold().apply_to(short_id(&item.id)),
        status_style(item.status).apply_to(item.status),
        item.priority,
        due
    );
    for record in history {
        let from = record
            .from_status
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        let marker = if record.kind == TransitionKind::Override {
            Style::new().yellow().apply_to("!")
        } else {
            dim.apply_to("·")
        };
        println!(
            "    {marker} {} {from} → {} {}",
            dim.apply_to(record.created_at.format("%H:%M:%S%.3f")),
            status_style(record.to_status).apply_to(record.to_status),
            dim.apply_to(format!("[{}] by {}: {}", record.kind, record.changed_by, record.reason)),
        );
    }
}

/// Imprime uma tabela com o estado de cada circuit breaker.
pub fn print_metrics(metrics: &[BreakerMetrics]) {
    let header = Style::new().bold();
    println!();
    println!("{}", header.apply_to("─── Dependency Health ───"));
    println!(
        "{:<14} {:<10} {:>6} {:>9} {:>11} {:>6}",
        "dependency", "state", "calls", "failures", "rejections", "trips"
    );
    for m in metrics {
        let state = match m.state {
            BreakerState::Closed => Style::new().green(),
            BreakerState::HalfOpen => Style::new().yellow(),
            BreakerState::Open => Style::new().red().bold(),
        };
        println!(
            "{:<14} {:<10} {:>6} {:>9} {:>11} {:>6}",
            m.name,
            state.apply_to(m.state.to_string()),
            m.calls,
            m.failures,
            m.rejections,
            m.trips
        );
    }
}

/// Imprime a sequência de atrasos de retentativa.
pub fn print_backoff(dependency: &str, schedule: &[Duration]) {
    println!(
        "{} {dependency}",
        Style::new().bold().apply_to("Retry schedule for")
    );
    if schedule.is_empty() {
        println!("  (no retries)");
    }
    for (attempt, delay) in schedule.iter().enumerate() {
        println!("  retry {:>2}: {:>6}ms", attempt + 1, delay.as_millis());
    }
}
